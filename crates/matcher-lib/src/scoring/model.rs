//! Scoring model with atomically published parameter snapshots

use super::ScoringParameters;
use crate::config::ScoringConfig;
use crate::error::{EngineError, EngineResult};
use crate::features::ResourceSchema;
use crate::feedback::FeedbackRecord;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

/// Holds the current parameter snapshot
///
/// Readers clone the current `Arc` and keep scoring against it even if a
/// newer snapshot is published meanwhile. The `current` lock only ever
/// guards an `Arc` clone or a pointer store: new parameters are computed
/// before the write lock is taken, so a reader never waits on learning and
/// a publish never waits on scoring. Writers are serialized by `updates`
/// so no update is lost.
pub struct ScoringModel {
    current: RwLock<Arc<ScoringParameters>>,
    updates: Mutex<()>,
    config: ScoringConfig,
}

impl ScoringModel {
    pub fn new(schema: &ResourceSchema, config: ScoringConfig) -> EngineResult<Self> {
        let initial = ScoringParameters::initial(schema, &config)?;
        Ok(Self::with_parameters(initial, config))
    }

    /// Start from previously learned parameters
    pub fn with_parameters(parameters: ScoringParameters, config: ScoringConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(parameters)),
            updates: Mutex::new(()),
            config,
        }
    }

    /// Current complete snapshot
    pub fn snapshot(&self) -> Arc<ScoringParameters> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Learn from a feedback batch and publish the result
    pub fn update(&self, batch: &[FeedbackRecord]) -> EngineResult<Arc<ScoringParameters>> {
        if batch.is_empty() {
            return Err(EngineError::InsufficientSignal);
        }

        let _serialized = self.updates.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.snapshot();
        let next = Arc::new(previous.apply_feedback(batch, &self.config));

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();

        debug!(
            from_version = previous.version,
            to_version = next.version,
            batch_size = batch.len(),
            "Scoring parameters updated"
        );

        Ok(next)
    }
}
