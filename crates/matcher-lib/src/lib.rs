//! Intent–resource matching engine
//!
//! This crate provides the core functionality for:
//! - Feature extraction from intents and resource offers
//! - Engagement scoring with learned, versioned parameters
//! - Candidate ranking and per-offer compare-and-commit allocation
//! - Allocation feedback and re-matching of pending intents
//! - Health checks and observability

pub mod allocation;
pub mod annotations;
pub mod config;
pub mod error;
pub mod features;
pub mod feedback;
pub mod health;
pub mod models;
pub mod observability;
pub mod ranking;
pub mod scoring;

pub use allocation::{Coordinator, CoordinatorBuilder, RematchWorker};
pub use annotations::AnnotationParser;
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};
