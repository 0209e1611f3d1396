//! Periodic feedback flushing and parameter persistence

use super::FeedbackRecorder;
use crate::error::EngineError;
use crate::health::{components, HealthRegistry};
use crate::observability::StructuredLogger;
use crate::scoring::ParameterStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Flushes pending feedback on an interval and persists new parameter versions
pub struct FeedbackWorker {
    recorder: Arc<FeedbackRecorder>,
    store: Option<ParameterStore>,
    flush_interval: Duration,
    logger: StructuredLogger,
    health: HealthRegistry,
    persisted_version: AtomicU64,
}

impl FeedbackWorker {
    pub fn new(
        recorder: Arc<FeedbackRecorder>,
        store: Option<ParameterStore>,
        flush_interval: Duration,
        logger: StructuredLogger,
        health: HealthRegistry,
    ) -> Self {
        Self {
            recorder,
            store,
            flush_interval,
            logger,
            health,
            persisted_version: AtomicU64::new(0),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.flush_interval.as_secs(),
            persistence = self.store.is_some(),
            "Starting feedback worker"
        );

        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    self.tick().await;
                    info!("Shutting down feedback worker");
                    break;
                }
            }
        }
    }

    /// One flush-and-persist pass
    pub async fn tick(&self) {
        self.flush();
        self.persist_if_newer().await;
    }

    /// Apply pending feedback; returns the new parameter version if a batch was applied
    pub fn flush(&self) -> Option<u64> {
        match self.recorder.flush() {
            Ok(batch) => {
                self.logger.log_feedback_applied(
                    batch.records,
                    batch.old_version,
                    batch.parameters.version,
                );
                Some(batch.parameters.version)
            }
            Err(EngineError::InsufficientSignal) => {
                debug!("No pending feedback to apply");
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to apply feedback batch");
                None
            }
        }
    }

    /// Persist the current snapshot if it has not been written yet
    pub async fn persist_if_newer(&self) -> bool {
        let Some(store) = &self.store else {
            return false;
        };

        let snapshot = self.recorder.model().snapshot();
        if snapshot.version <= self.persisted_version.load(Ordering::Acquire) {
            return false;
        }

        let store = store.clone();
        let parameters = snapshot.clone();
        let result = tokio::task::spawn_blocking(move || store.save(&parameters)).await;

        match result {
            Ok(Ok(path)) => {
                self.persisted_version
                    .store(snapshot.version, Ordering::Release);
                self.logger
                    .log_parameters_persisted(snapshot.version, &path.display().to_string(), true);
                self.health.set_healthy(components::FEEDBACK).await;
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, version = snapshot.version, "Parameter persistence failed");
                self.logger
                    .log_parameters_persisted(snapshot.version, "", false);
                self.health
                    .set_degraded(components::FEEDBACK, format!("persistence failed: {}", e))
                    .await;
                false
            }
            Err(e) => {
                warn!(error = %e, "Parameter persistence task panicked");
                false
            }
        }
    }
}
