//! Observability infrastructure for the matching engine
//!
//! Provides:
//! - Prometheus metrics (match latency, decisions, conflicts, catalog gauges, model version)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Histogram buckets for match latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    match_latency_seconds: Histogram,
    decisions: IntCounterVec,
    commit_conflicts: IntCounter,
    offer_rejections: IntCounter,
    preemptions: IntCounter,
    active_bindings: IntGauge,
    pending_intents: IntGauge,
    advertised_offers: IntGauge,
    feedback_records: IntCounterVec,
    parameter_version: IntGauge,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            match_latency_seconds: register_histogram!(
                "intent_matcher_match_latency_seconds",
                "Time spent matching one intent, ranking included",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register match_latency_seconds"),

            decisions: register_int_counter_vec!(
                "intent_matcher_decisions_total",
                "Match decisions by outcome",
                &["outcome"]
            )
            .expect("Failed to register decisions_total"),

            commit_conflicts: register_int_counter!(
                "intent_matcher_commit_conflicts_total",
                "Commits that lost a race for offer capacity"
            )
            .expect("Failed to register commit_conflicts_total"),

            offer_rejections: register_int_counter!(
                "intent_matcher_offer_rejections_total",
                "Provisional bindings refused by the offering provider"
            )
            .expect("Failed to register offer_rejections_total"),

            preemptions: register_int_counter!(
                "intent_matcher_preemptions_total",
                "Bindings revoked to make room for higher-priority intents"
            )
            .expect("Failed to register preemptions_total"),

            active_bindings: register_int_gauge!(
                "intent_matcher_active_bindings",
                "Number of confirmed bindings"
            )
            .expect("Failed to register active_bindings"),

            pending_intents: register_int_gauge!(
                "intent_matcher_pending_intents",
                "Number of intents waiting for capacity"
            )
            .expect("Failed to register pending_intents"),

            advertised_offers: register_int_gauge!(
                "intent_matcher_advertised_offers",
                "Number of offers in the catalog"
            )
            .expect("Failed to register advertised_offers"),

            feedback_records: register_int_counter_vec!(
                "intent_matcher_feedback_records_total",
                "Feedback records accepted by the recorder, by outcome",
                &["outcome"]
            )
            .expect("Failed to register feedback_records_total"),

            parameter_version: register_int_gauge!(
                "intent_matcher_parameter_version",
                "Version of the published scoring parameters"
            )
            .expect("Failed to register parameter_version"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new)
    }

    pub fn observe_match_latency(&self, duration_secs: f64) {
        self.inner().match_latency_seconds.observe(duration_secs);
    }

    pub fn inc_decision(&self, outcome: &str) {
        self.inner().decisions.with_label_values(&[outcome]).inc();
    }

    pub fn inc_commit_conflicts(&self) {
        self.inner().commit_conflicts.inc();
    }

    pub fn inc_offer_rejections(&self) {
        self.inner().offer_rejections.inc();
    }

    pub fn inc_preemptions(&self, count: u64) {
        self.inner().preemptions.inc_by(count);
    }

    pub fn set_active_bindings(&self, count: i64) {
        self.inner().active_bindings.set(count);
    }

    pub fn set_pending_intents(&self, count: i64) {
        self.inner().pending_intents.set(count);
    }

    pub fn set_advertised_offers(&self, count: i64) {
        self.inner().advertised_offers.set(count);
    }

    pub fn inc_feedback_record(&self, outcome: &str) {
        self.inner()
            .feedback_records
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn set_parameter_version(&self, version: u64) {
        self.inner().parameter_version.set(version as i64);
    }
}

/// Structured logger for engine events
///
/// Every line carries an `event` field so decisions and catalog changes can
/// be filtered out of the JSON log stream.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn log_intent_submitted(&self, intent_id: &str, priority: &str, dimensions: usize) {
        info!(
            event = "intent_submitted",
            instance = %self.instance,
            intent_id = %intent_id,
            priority = %priority,
            requested_dimensions = dimensions,
            "Intent submitted"
        );
    }

    /// Log a match decision; only called when the intent's outcome changes
    pub fn log_match_decision(
        &self,
        intent_id: &str,
        outcome: &str,
        offer_id: Option<&str>,
        candidates: usize,
        reason: Option<&str>,
    ) {
        info!(
            event = "match_decision",
            instance = %self.instance,
            intent_id = %intent_id,
            outcome = %outcome,
            offer_id = ?offer_id,
            candidates = candidates,
            reason = ?reason,
            "Match decision"
        );
    }

    pub fn log_binding_committed(
        &self,
        binding_id: &str,
        intent_id: &str,
        offer_id: &str,
        score: f64,
        parameter_version: u64,
    ) {
        info!(
            event = "binding_committed",
            instance = %self.instance,
            binding_id = %binding_id,
            intent_id = %intent_id,
            offer_id = %offer_id,
            score = score,
            parameter_version = parameter_version,
            "Binding committed"
        );
    }

    pub fn log_binding_revoked(&self, binding_id: &str, intent_id: &str, offer_id: &str, cause: &str) {
        warn!(
            event = "binding_revoked",
            instance = %self.instance,
            binding_id = %binding_id,
            intent_id = %intent_id,
            offer_id = %offer_id,
            cause = %cause,
            "Binding revoked"
        );
    }

    pub fn log_offer_advertised(&self, offer_id: &str, region: &str, local: bool) {
        info!(
            event = "offer_advertised",
            instance = %self.instance,
            offer_id = %offer_id,
            region = %region,
            local = local,
            "Offer advertised"
        );
    }

    pub fn log_offer_withdrawn(&self, offer_id: &str, revoked_bindings: usize) {
        info!(
            event = "offer_withdrawn",
            instance = %self.instance,
            offer_id = %offer_id,
            revoked_bindings = revoked_bindings,
            "Offer withdrawn"
        );
    }

    pub fn log_feedback_applied(&self, records: usize, old_version: u64, new_version: u64) {
        info!(
            event = "feedback_applied",
            instance = %self.instance,
            records = records,
            old_version = old_version,
            new_version = new_version,
            "Feedback applied to scoring model"
        );
    }

    pub fn log_parameters_persisted(&self, version: u64, path: &str, success: bool) {
        if success {
            debug!(
                event = "parameters_persisted",
                instance = %self.instance,
                version = version,
                path = %path,
                "Scoring parameters persisted"
            );
        } else {
            warn!(
                event = "parameters_persisted",
                instance = %self.instance,
                version = version,
                path = %path,
                "Failed to persist scoring parameters, keeping them in memory"
            );
        }
    }

    pub fn log_startup(&self, version: &str, parameter_version: u64, resources: &[String]) {
        info!(
            event = "engine_started",
            instance = %self.instance,
            engine_version = %version,
            parameter_version = parameter_version,
            resources = ?resources,
            "Matching engine started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "engine_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Matching engine shutting down"
        );
    }
}
