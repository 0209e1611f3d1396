//! Allocation coordinator
//!
//! The only writer of intent state, bindings and offer capacity. Matching
//! takes the intent's lock for the whole attempt, snapshots the catalog,
//! ranks it against one scoring snapshot and walks the ranking with
//! per-offer compare-and-commit.
//!
//! Lock order is intent -> offer -> feedback pending -> model update. Offer
//! locks are only held inside [`OfferCatalog`] calls, never while an
//! intent lock is being acquired.

use super::{AcceptAll, Binding, BindingId, CapacityAudit, CommitError, OfferAcceptor, OfferCatalog};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::features::{FeatureExtractor, IntentVector, OfferVector, ResourceSchema};
use crate::feedback::{FeedbackOutcome, FeedbackRecord, FeedbackRecorder};
use crate::models::{
    DecisionEvent, IntentId, IntentSpec, IntentState, IntentStatus, MatchResult, OfferId,
    OfferSpec, PriorityTier, Quantity,
};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::ranking::Ranker;
use crate::scoring::{ScoringModel, ScoringParameters};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct BindingRef {
    binding_id: BindingId,
    offer_id: OfferId,
}

struct IntentEntry {
    vector: IntentVector,
    state: IntentState,
    binding: Option<BindingRef>,
    seq: u64,
    last_outcome: Option<MatchResult>,
    attempts: u32,
    submitted_at: DateTime<Utc>,
    removed: bool,
}

/// When a decision is published to subscribers
#[derive(Clone, Copy, PartialEq, Eq)]
enum Notify {
    /// Every outcome of an explicit `submit` or `match_intent`
    Always,
    /// Re-matching sweeps publish only outcomes that differ from the last one
    OnChange,
}

enum Attempt {
    Bound(Binding),
    Rejected,
    Conflict,
    Gone,
}

/// Counts from one re-matching pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RematchSummary {
    pub attempted: usize,
    pub bound: usize,
    pub deferred: usize,
    pub failed: usize,
}

/// Builds a [`Coordinator`] with optional collaborators
pub struct CoordinatorBuilder {
    config: EngineConfig,
    acceptor: Arc<dyn OfferAcceptor>,
    parameters: Option<ScoringParameters>,
    logger: StructuredLogger,
}

impl CoordinatorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            acceptor: Arc::new(AcceptAll),
            parameters: None,
            logger: StructuredLogger::new("intent-matcher"),
        }
    }

    pub fn acceptor(mut self, acceptor: Arc<dyn OfferAcceptor>) -> Self {
        self.acceptor = acceptor;
        self
    }

    /// Start from previously learned parameters instead of the configured defaults
    pub fn parameters(mut self, parameters: ScoringParameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn build(self) -> EngineResult<Coordinator> {
        let schema = ResourceSchema::from_config(&self.config.resources)?;

        let model = match self.parameters {
            Some(parameters) => {
                parameters.validate(schema.len())?;
                ScoringModel::with_parameters(parameters, self.config.scoring.clone())
            }
            None => ScoringModel::new(&schema, self.config.scoring.clone())?,
        };
        let model = Arc::new(model);
        let recorder = Arc::new(FeedbackRecorder::new(
            model.clone(),
            self.config.feedback.batch_size,
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let metrics = EngineMetrics::new();
        metrics.set_parameter_version(model.version());

        Ok(Coordinator {
            ranker: Ranker::new(schema.scales()),
            extractor: FeatureExtractor::new(schema),
            catalog: OfferCatalog::new(),
            intents: DashMap::new(),
            model,
            recorder,
            acceptor: self.acceptor,
            events,
            next_seq: AtomicU64::new(1),
            preemption_enabled: self.config.preemption_enabled,
            metrics,
            logger: self.logger,
        })
    }
}

/// Matches intents to offers and owns all allocation state
pub struct Coordinator {
    extractor: FeatureExtractor,
    ranker: Ranker,
    catalog: OfferCatalog,
    intents: DashMap<IntentId, Arc<Mutex<IntentEntry>>>,
    model: Arc<ScoringModel>,
    recorder: Arc<FeedbackRecorder>,
    acceptor: Arc<dyn OfferAcceptor>,
    events: broadcast::Sender<DecisionEvent>,
    next_seq: AtomicU64,
    preemption_enabled: bool,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl Coordinator {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        CoordinatorBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    pub fn schema(&self) -> &ResourceSchema {
        self.extractor.schema()
    }

    pub fn model(&self) -> &Arc<ScoringModel> {
        &self.model
    }

    pub fn recorder(&self) -> &Arc<FeedbackRecorder> {
        &self.recorder
    }

    pub fn parameters(&self) -> Arc<ScoringParameters> {
        self.model.snapshot()
    }

    /// Decision notifications for the reconciliation layer
    pub fn subscribe(&self) -> broadcast::Receiver<DecisionEvent> {
        self.events.subscribe()
    }

    /// Catalog epoch; changes whenever capacity may have become available
    pub fn catalog_changes(&self) -> watch::Receiver<u64> {
        self.catalog.subscribe()
    }

    // ---- intents ----

    /// Register an intent and run an immediate match
    pub fn submit(&self, spec: IntentSpec) -> EngineResult<MatchResult> {
        let vector = self.extractor.extract_intent(&spec)?;
        let intent_id = vector.intent_id.clone();
        let priority = vector.priority;
        let dimensions = vector.requested_dims().count();

        match self.intents.entry(intent_id.clone()) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateIntent(intent_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(IntentEntry {
                    vector,
                    state: IntentState::Pending,
                    binding: None,
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    last_outcome: None,
                    attempts: 0,
                    submitted_at: Utc::now(),
                    removed: false,
                })));
            }
        }

        self.logger
            .log_intent_submitted(&intent_id, priority_label(priority), dimensions);
        self.match_intent(&intent_id)
    }

    /// Match one intent against the current catalog
    ///
    /// Bound intents keep their binding and Failed is terminal; both return
    /// their existing outcome without re-ranking.
    /// Every call publishes its outcome to subscribers.
    pub fn match_intent(&self, intent_id: &str) -> EngineResult<MatchResult> {
        let result = self.run_match(intent_id, Notify::Always)?;
        self.refresh_gauges();
        Ok(result)
    }

    fn run_match(&self, intent_id: &str, notify: Notify) -> EngineResult<MatchResult> {
        let start = Instant::now();
        let entry = self.entry(intent_id)?;

        let (result, victims) = {
            let mut intent = lock(&entry);
            if intent.removed {
                return Err(EngineError::IntentNotFound(intent_id.to_string()));
            }
            self.match_locked(&mut intent, notify)
        };

        if !victims.is_empty() {
            self.settle_victims(intent_id, victims);
        }

        self.metrics
            .observe_match_latency(start.elapsed().as_secs_f64());
        Ok(result)
    }

    /// Remove an intent, releasing its binding if it holds one
    pub fn withdraw_intent(&self, intent_id: &str) -> EngineResult<()> {
        let (_, entry) = self
            .intents
            .remove(intent_id)
            .ok_or_else(|| EngineError::IntentNotFound(intent_id.to_string()))?;

        let mut intent = lock(&entry);
        intent.removed = true;
        intent.state = IntentState::Released;

        if let Some(bound) = intent.binding.take() {
            if let Some((binding, offer)) = self.catalog.revoke(&bound.offer_id, &bound.binding_id) {
                self.recorder.record(FeedbackRecord::new(
                    &binding,
                    &offer,
                    FeedbackOutcome::Reclaimed,
                ));
                self.logger.log_binding_revoked(
                    &binding.id,
                    intent_id,
                    &binding.offer_id,
                    "intent_withdrawn",
                );
                self.catalog.bump_epoch();
            }
        }
        drop(intent);

        debug!(intent_id = %intent_id, "Intent withdrawn");
        self.refresh_gauges();
        Ok(())
    }

    pub fn intent_status(&self, intent_id: &str) -> EngineResult<IntentStatus> {
        let entry = self.entry(intent_id)?;
        let intent = lock(&entry);
        Ok(IntentStatus {
            intent_id: intent.vector.intent_id.clone(),
            state: intent.state,
            priority: intent.vector.priority,
            offer_id: intent.binding.as_ref().map(|b| b.offer_id.clone()),
            binding_id: intent.binding.as_ref().map(|b| b.binding_id.clone()),
            last_outcome: intent.last_outcome.clone(),
            attempts: intent.attempts,
            submitted_at: intent.submitted_at,
        })
    }

    /// Re-match every Pending intent, highest priority tier first, then by
    /// submission order
    ///
    /// Only outcomes that changed are published; gauges refresh once at the end.
    pub fn rematch_pending(&self) -> RematchSummary {
        let mut pending: Vec<(PriorityTier, u64, IntentId)> = self
            .entries()
            .into_iter()
            .filter_map(|entry| {
                let intent = lock(&entry);
                (intent.state == IntentState::Pending && !intent.removed).then(|| {
                    (
                        intent.vector.priority,
                        intent.seq,
                        intent.vector.intent_id.clone(),
                    )
                })
            })
            .collect();
        pending.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut summary = RematchSummary::default();
        for (_, _, intent_id) in pending {
            match self.run_match(&intent_id, Notify::OnChange) {
                Ok(result) => {
                    summary.attempted += 1;
                    match result {
                        MatchResult::Bound(_) => summary.bound += 1,
                        MatchResult::Deferred => summary.deferred += 1,
                        MatchResult::Failed => summary.failed += 1,
                    }
                }
                // Withdrawn while the pass was running
                Err(EngineError::IntentNotFound(_)) => {}
                Err(e) => debug!(intent_id = %intent_id, error = %e, "Re-match skipped"),
            }
        }

        self.refresh_gauges();
        summary
    }

    pub fn pending_count(&self) -> usize {
        self.entries()
            .into_iter()
            .filter(|entry| lock(entry).state == IntentState::Pending)
            .count()
    }

    // ---- offers ----

    pub fn advertise(&self, spec: OfferSpec) -> EngineResult<OfferVector> {
        let offer = self.extractor.extract_offer(&spec)?;
        self.catalog.insert(offer.clone())?;

        self.logger
            .log_offer_advertised(&offer.offer_id, &offer.locality.region, offer.local);
        self.refresh_gauges();
        Ok(offer)
    }

    /// Apply a signed capacity delta to an offer
    pub fn update_capacity(
        &self,
        offer_id: &str,
        delta: &BTreeMap<String, Quantity>,
    ) -> EngineResult<OfferVector> {
        let delta = self.extractor.extract_delta(delta)?;
        let offer = self.catalog.update_capacity(offer_id, &delta)?;
        debug!(offer_id = %offer_id, delta = ?delta, "Offer capacity updated");
        Ok(offer)
    }

    /// Remove an offer; its bindings are revoked and their intents go back to Pending
    pub fn withdraw_offer(&self, offer_id: &str) -> EngineResult<Vec<IntentId>> {
        let (offer, revoked) = self.catalog.withdraw(offer_id)?;
        self.logger.log_offer_withdrawn(offer_id, revoked.len());

        let mut displaced = Vec::with_capacity(revoked.len());
        for binding in &revoked {
            self.recorder.record(FeedbackRecord::new(
                binding,
                &offer,
                FeedbackOutcome::Reclaimed,
            ));
            self.logger.log_binding_revoked(
                &binding.id,
                &binding.intent_id,
                offer_id,
                "offer_withdrawn",
            );

            let reason = format!("offer {} withdrawn", offer_id);
            if self.release_to_pending(&binding.intent_id, &binding.id, &reason) {
                displaced.push(binding.intent_id.clone());
            }
        }

        self.refresh_gauges();
        Ok(displaced)
    }

    /// Current copy of every offer, ordered by id
    pub fn offers(&self) -> Vec<OfferVector> {
        self.catalog.snapshot()
    }

    pub fn offer(&self, offer_id: &str) -> EngineResult<OfferVector> {
        self.catalog
            .offer(offer_id)
            .ok_or_else(|| EngineError::OfferNotFound(offer_id.to_string()))
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.catalog.bindings()
    }

    /// Check capacity bookkeeping on every offer
    pub fn audit_capacity(&self) -> CapacityAudit {
        self.catalog.audit()
    }

    // ---- internals ----

    fn match_locked(
        &self,
        intent: &mut IntentEntry,
        notify: Notify,
    ) -> (MatchResult, Vec<Binding>) {
        let settled = match intent.state {
            IntentState::Failed => Some(MatchResult::Failed),
            IntentState::Bound | IntentState::Matched => intent
                .binding
                .as_ref()
                .map(|bound| MatchResult::Bound(bound.offer_id.clone())),
            IntentState::Pending | IntentState::Released => None,
        };
        if let Some(outcome) = settled {
            if notify == Notify::Always {
                self.publish(intent, outcome.clone(), None);
            }
            return (outcome, Vec::new());
        }

        intent.attempts += 1;

        if let Some(batch) = self.recorder.ensure_applied(&intent.vector.intent_id) {
            self.logger.log_feedback_applied(
                batch.records,
                batch.old_version,
                batch.parameters.version,
            );
        }

        let offers = self.catalog.snapshot();
        let params = self.model.snapshot();
        let ranked = self.ranker.rank(&intent.vector, &offers, &*params);

        for candidate in &ranked {
            let committed = self.catalog.try_commit(&candidate.offer_id, &intent.vector);
            if let Attempt::Bound(binding) = self.complete(intent, committed) {
                self.logger.log_binding_committed(
                    &binding.id,
                    &binding.intent_id,
                    &binding.offer_id,
                    candidate.score,
                    params.version,
                );
                let outcome = MatchResult::Bound(binding.offer_id.clone());
                self.decide(intent, outcome.clone(), None, ranked.len(), notify);
                return (outcome, Vec::new());
            }
        }

        if self.preemption_enabled {
            if let Some((outcome, victims)) = self.preempt(intent, &offers, &params) {
                self.decide(intent, outcome.clone(), None, ranked.len(), notify);
                return (outcome, victims);
            }
        }

        if ranked.is_empty() && self.ranker.is_structurally_unsatisfiable(&intent.vector, &offers) {
            intent.state = IntentState::Failed;
            let tags: Vec<&str> = intent.vector.mandatory_tags.iter().map(String::as_str).collect();
            let reason = format!("no offer carries all of [{}]", tags.join(", "));
            self.decide(intent, MatchResult::Failed, Some(reason), 0, notify);
            return (MatchResult::Failed, Vec::new());
        }

        intent.state = IntentState::Pending;
        let reason = if ranked.is_empty() {
            self.ranker.explain(&intent.vector, &offers)
        } else {
            format!("{} candidates taken or declined", ranked.len())
        };
        self.decide(intent, MatchResult::Deferred, Some(reason), ranked.len(), notify);
        (MatchResult::Deferred, Vec::new())
    }

    /// Finish a compare-and-commit: ask the provider, then confirm or roll back
    fn complete(
        &self,
        intent: &mut IntentEntry,
        committed: Result<(Binding, OfferVector), CommitError>,
    ) -> Attempt {
        let (binding, offer) = match committed {
            Ok(committed) => committed,
            Err(CommitError::Conflict) => {
                self.metrics.inc_commit_conflicts();
                return Attempt::Conflict;
            }
            Err(CommitError::Gone) => return Attempt::Gone,
        };

        intent.state = IntentState::Matched;

        if !self.acceptor.acquire(&offer, &binding) {
            self.metrics.inc_offer_rejections();
            if let Some((revoked, offer)) = self.catalog.revoke(&binding.offer_id, &binding.id) {
                self.recorder.record(FeedbackRecord::new(
                    &revoked,
                    &offer,
                    FeedbackOutcome::RejectedByOffer,
                ));
            }
            self.logger.log_binding_revoked(
                &binding.id,
                &binding.intent_id,
                &binding.offer_id,
                "rejected_by_offer",
            );
            intent.state = IntentState::Pending;
            return Attempt::Rejected;
        }

        // Withdrawal may have drained the binding between commit and confirm
        if !self.catalog.confirm(&binding.offer_id, &binding.id) {
            intent.state = IntentState::Pending;
            return Attempt::Gone;
        }

        self.recorder.record(FeedbackRecord::new(
            &binding,
            &offer,
            FeedbackOutcome::Accepted,
        ));
        intent.state = IntentState::Bound;
        intent.binding = Some(BindingRef {
            binding_id: binding.id.clone(),
            offer_id: binding.offer_id.clone(),
        });
        Attempt::Bound(binding)
    }

    /// Try to make room on an offer by revoking lower-tier bindings
    fn preempt(
        &self,
        intent: &mut IntentEntry,
        offers: &[OfferVector],
        params: &Arc<ScoringParameters>,
    ) -> Option<(MatchResult, Vec<Binding>)> {
        let candidates = self
            .ranker
            .preemption_candidates(&intent.vector, offers, &**params);
        let mut victims = Vec::new();

        for candidate in candidates {
            let Ok(preempted) = self.catalog.try_preempt(&candidate.offer_id, &intent.vector) else {
                continue;
            };

            self.metrics.inc_preemptions(preempted.victims.len() as u64);
            for victim in &preempted.victims {
                self.recorder.record(FeedbackRecord::new(
                    victim,
                    &preempted.offer,
                    FeedbackOutcome::Reclaimed,
                ));
                self.logger.log_binding_revoked(
                    &victim.id,
                    &victim.intent_id,
                    &victim.offer_id,
                    "preempted",
                );
            }
            victims.extend(preempted.victims);

            let committed = Ok((preempted.binding, preempted.offer));
            if let Attempt::Bound(binding) = self.complete(intent, committed) {
                self.logger.log_binding_committed(
                    &binding.id,
                    &binding.intent_id,
                    &binding.offer_id,
                    candidate.score,
                    params.version,
                );
                return Some((MatchResult::Bound(binding.offer_id), victims));
            }
        }

        if victims.is_empty() {
            None
        } else {
            // Victims were already revoked; they still need to go back to Pending
            Some((MatchResult::Deferred, victims))
        }
    }

    /// Return preempted intents to Pending once the preemptor's lock is released
    fn settle_victims(&self, preemptor: &str, victims: Vec<Binding>) {
        let reason = format!("preempted by {}", preemptor);
        for victim in &victims {
            self.release_to_pending(&victim.intent_id, &victim.id, &reason);
        }
        self.catalog.bump_epoch();
    }

    /// Move an intent back to Pending if it still holds `binding_id`
    fn release_to_pending(&self, intent_id: &str, binding_id: &str, reason: &str) -> bool {
        let Ok(entry) = self.entry(intent_id) else {
            return false;
        };
        let mut intent = lock(&entry);

        let holds = intent
            .binding
            .as_ref()
            .map(|b| b.binding_id == binding_id)
            .unwrap_or(false);
        if !holds || intent.removed {
            return false;
        }

        intent.binding = None;
        intent.state = IntentState::Pending;
        self.decide(
            &mut intent,
            MatchResult::Deferred,
            Some(reason.to_string()),
            0,
            Notify::Always,
        );
        true
    }

    /// Record an outcome and publish it according to `notify`
    fn decide(
        &self,
        intent: &mut IntentEntry,
        outcome: MatchResult,
        reason: Option<String>,
        candidates: usize,
        notify: Notify,
    ) {
        self.metrics.inc_decision(outcome.label());

        if notify == Notify::OnChange && intent.last_outcome.as_ref() == Some(&outcome) {
            return;
        }

        self.logger.log_match_decision(
            &intent.vector.intent_id,
            outcome.label(),
            outcome.offer_id(),
            candidates,
            reason.as_deref(),
        );
        self.publish(intent, outcome, reason);
    }

    fn publish(&self, intent: &mut IntentEntry, outcome: MatchResult, reason: Option<String>) {
        intent.last_outcome = Some(outcome.clone());
        // No subscribers is fine; events are advisory
        let _ = self.events.send(DecisionEvent {
            intent_id: intent.vector.intent_id.clone(),
            outcome,
            reason,
            timestamp: Utc::now(),
        });
    }

    fn entry(&self, intent_id: &str) -> EngineResult<Arc<Mutex<IntentEntry>>> {
        self.intents
            .get(intent_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::IntentNotFound(intent_id.to_string()))
    }

    fn entries(&self) -> Vec<Arc<Mutex<IntentEntry>>> {
        self.intents.iter().map(|e| e.value().clone()).collect()
    }

    fn refresh_gauges(&self) {
        self.metrics
            .set_active_bindings(self.catalog.confirmed_count() as i64);
        self.metrics.set_advertised_offers(self.catalog.len() as i64);
        self.metrics.set_pending_intents(self.pending_count() as i64);
    }
}

fn lock(entry: &Mutex<IntentEntry>) -> MutexGuard<'_, IntentEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

fn priority_label(priority: PriorityTier) -> &'static str {
    match priority {
        PriorityTier::Low => "low",
        PriorityTier::Normal => "normal",
        PriorityTier::High => "high",
        PriorityTier::Critical => "critical",
    }
}
