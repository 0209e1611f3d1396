//! Level-triggered re-matching of pending intents
//!
//! Every catalog change bumps an epoch. The worker waits for the epoch to
//! move, lets a short quiet period pass so bursts of changes collapse into
//! one pass, then re-matches all Pending intents. A periodic sweep covers
//! anything a missed wakeup would leave behind.

use super::{Coordinator, RematchSummary};
use crate::config::RematchConfig;
use crate::health::{components, HealthRegistry};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct RematchWorker {
    coordinator: Arc<Coordinator>,
    config: RematchConfig,
    health: HealthRegistry,
}

impl RematchWorker {
    pub fn new(coordinator: Arc<Coordinator>, config: RematchConfig, health: HealthRegistry) -> Self {
        Self {
            coordinator,
            config,
            health,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            debounce_ms = self.config.debounce_ms,
            sweep_interval_secs = self.config.sweep_interval().as_secs(),
            "Starting re-match worker"
        );

        let mut changes = self.coordinator.catalog_changes();
        let mut sweep = interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        // Catch up on changes made before this receiver existed
        changes.borrow_and_update();
        self.pass("startup").await;

        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        warn!("Catalog change channel closed, stopping re-match worker");
                        break;
                    }
                    self.settle(&mut changes).await;
                    self.pass("catalog_change").await;
                }
                _ = sweep.tick() => {
                    self.pass("sweep").await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down re-match worker");
                    break;
                }
            }
        }
    }

    /// Wait out the debounce window; changes that land during it are folded in
    async fn settle(&self, changes: &mut watch::Receiver<u64>) {
        let debounce = self.config.debounce();
        if !debounce.is_zero() {
            sleep(debounce).await;
        }
        let epoch = *changes.borrow_and_update();
        debug!(epoch, "Catalog settled");
    }

    /// Run one re-matching pass off the async runtime
    pub async fn pass(&self, trigger: &'static str) -> RematchSummary {
        let coordinator = self.coordinator.clone();
        match tokio::task::spawn_blocking(move || coordinator.rematch_pending()).await {
            Ok(summary) => {
                if summary.attempted > 0 {
                    info!(
                        trigger,
                        attempted = summary.attempted,
                        bound = summary.bound,
                        deferred = summary.deferred,
                        failed = summary.failed,
                        "Re-match pass completed"
                    );
                }
                self.health.set_healthy(components::REMATCH).await;
                summary
            }
            Err(e) => {
                warn!(trigger, error = %e, "Re-match pass panicked");
                self.health
                    .set_unhealthy(components::REMATCH, format!("re-match pass failed: {}", e))
                    .await;
                RematchSummary::default()
            }
        }
    }
}
