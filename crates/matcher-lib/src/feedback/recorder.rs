//! Feedback recorder
//!
//! Append-only log of allocation outcomes. Records are batched and applied
//! to the scoring model; a match never runs while feedback about its own
//! intent is still sitting in the pending batch.

use super::FeedbackRecord;
use crate::error::{EngineError, EngineResult};
use crate::observability::EngineMetrics;
use crate::scoring::{ScoringModel, ScoringParameters};
use dashmap::DashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::debug;

/// Summary of one applied batch
#[derive(Debug, Clone)]
pub struct AppliedBatch {
    pub records: usize,
    pub old_version: u64,
    pub parameters: Arc<ScoringParameters>,
}

pub struct FeedbackRecorder {
    model: Arc<ScoringModel>,
    seen: DashSet<String>,
    log: RwLock<Vec<FeedbackRecord>>,
    pending: Mutex<Vec<FeedbackRecord>>,
    batch_size: usize,
    metrics: EngineMetrics,
}

impl FeedbackRecorder {
    pub fn new(model: Arc<ScoringModel>, batch_size: usize) -> Self {
        Self {
            model,
            seen: DashSet::new(),
            log: RwLock::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
            metrics: EngineMetrics::new(),
        }
    }

    pub fn model(&self) -> &Arc<ScoringModel> {
        &self.model
    }

    /// Append a record; `false` if the same (binding, outcome) was already recorded
    ///
    /// Applies the pending batch once it reaches the configured size.
    pub fn record(&self, record: FeedbackRecord) -> bool {
        if !self.seen.insert(record.id.clone()) {
            debug!(
                record_id = %record.id,
                binding_id = %record.binding_id,
                "Duplicate feedback record ignored"
            );
            return false;
        }

        self.metrics.inc_feedback_record(record.outcome.label());
        self.log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());

        let mut pending = self.lock_pending();
        pending.push(record);
        if pending.len() >= self.batch_size {
            // Batch is non-empty here, so the update cannot be InsufficientSignal
            let _ = self.apply(&mut pending);
        }
        true
    }

    /// Apply everything pending
    pub fn flush(&self) -> EngineResult<AppliedBatch> {
        let mut pending = self.lock_pending();
        self.apply(&mut pending)
    }

    /// Apply pending feedback if any of it concerns `intent_id`
    ///
    /// The pending lock is held across the model update, so a concurrent
    /// flush cannot leave this intent's feedback half-applied when the
    /// caller goes on to score.
    pub fn ensure_applied(&self, intent_id: &str) -> Option<AppliedBatch> {
        let mut pending = self.lock_pending();
        if !pending.iter().any(|r| r.intent_id == intent_id) {
            return None;
        }
        self.apply(&mut pending).ok()
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn has_pending_for(&self, intent_id: &str) -> bool {
        self.lock_pending().iter().any(|r| r.intent_id == intent_id)
    }

    /// Every record accepted so far, in arrival order
    pub fn records(&self) -> Vec<FeedbackRecord> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn records_for(&self, intent_id: &str) -> Vec<FeedbackRecord> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.intent_id == intent_id)
            .cloned()
            .collect()
    }

    fn apply(&self, pending: &mut Vec<FeedbackRecord>) -> EngineResult<AppliedBatch> {
        if pending.is_empty() {
            return Err(EngineError::InsufficientSignal);
        }

        let old_version = self.model.version();
        let parameters = self.model.update(pending)?;
        let records = pending.len();
        pending.clear();

        self.metrics.set_parameter_version(parameters.version);
        debug!(
            records,
            old_version,
            new_version = parameters.version,
            "Feedback batch applied"
        );

        Ok(AppliedBatch {
            records,
            old_version,
            parameters,
        })
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<FeedbackRecord>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
