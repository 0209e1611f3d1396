//! Intent Matcher - intent-to-resource matching service
//!
//! Runs the matching engine behind an HTTP API, with background workers
//! for feedback learning and re-matching of pending intents.

use anyhow::{Context, Result};
use intent_matcher::{api, config::MatcherConfig};
use matcher_lib::{
    allocation::{Coordinator, RematchWorker},
    annotations::AnnotationParser,
    feedback::FeedbackWorker,
    health::{components, HealthRegistry},
    observability::{EngineMetrics, StructuredLogger},
    scoring::ParameterStore,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MATCHER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting intent-matcher");

    // Load configuration
    let config = MatcherConfig::load()?;
    info!(instance = %config.instance_name, "Matcher configured");

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    for component in components::ALL {
        health_registry.register(component).await;
    }

    let logger = StructuredLogger::new(&config.instance_name);

    // Restore learned parameters when a store is configured
    let store = match &config.parameter_dir {
        Some(dir) => Some(
            ParameterStore::new(dir, config.parameter_versions_to_keep)
                .context("Failed to open parameter store")?,
        ),
        None => None,
    };
    let restored = match &store {
        Some(store) => store.load_latest().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read persisted parameters, starting fresh");
            None
        }),
        None => None,
    };

    let coordinator = build_coordinator(&config, restored, &logger)?;
    let coordinator = Arc::new(coordinator);

    let metrics = EngineMetrics::new();
    let resources: Vec<String> = coordinator
        .schema()
        .kinds()
        .iter()
        .map(|k| k.name.clone())
        .collect();
    logger.log_startup(MATCHER_VERSION, coordinator.model().version(), &resources);

    // Background workers share one shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let feedback_worker = Arc::new(FeedbackWorker::new(
        coordinator.recorder().clone(),
        store,
        config.engine.feedback.flush_interval(),
        logger.clone(),
        health_registry.clone(),
    ));
    let feedback_handle = tokio::spawn(feedback_worker.run(shutdown_tx.subscribe()));

    let rematch_worker = Arc::new(RematchWorker::new(
        coordinator.clone(),
        config.engine.rematch.clone(),
        health_registry.clone(),
    ));
    let rematch_handle = tokio::spawn(rematch_worker.run(shutdown_tx.subscribe()));

    // Create shared application state
    let app_state = Arc::new(api::AppState::new(
        coordinator.clone(),
        health_registry.clone(),
        metrics,
        AnnotationParser::new(config.engine.annotation_prefix.clone()),
    ));

    // Mark matcher as ready after initialization
    health_registry.set_ready(true).await;

    // Start the API server
    let mut api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, async move {
        let _ = api_shutdown.recv().await;
    }));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    info!("Shutting down");

    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    // The feedback worker flushes and persists once more on its way out
    for (name, handle) in [("feedback", feedback_handle), ("rematch", rematch_handle)] {
        if let Err(e) = handle.await {
            warn!(worker = name, error = %e, "Worker task failed");
        }
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    Ok(())
}

fn build_coordinator(
    config: &MatcherConfig,
    restored: Option<matcher_lib::scoring::ScoringParameters>,
    logger: &StructuredLogger,
) -> Result<Coordinator> {
    let builder = || Coordinator::builder(config.engine.clone()).logger(logger.clone());

    if let Some(parameters) = restored {
        let version = parameters.version;
        match builder().parameters(parameters).build() {
            Ok(coordinator) => return Ok(coordinator),
            Err(e) => warn!(
                version,
                error = %e,
                "Persisted parameters do not fit the configured resources, starting fresh"
            ),
        }
    }

    builder()
        .build()
        .context("Failed to build matching engine")
}
