//! Engine configuration
//!
//! Every field carries a serde default so a partial file or environment
//! overlay is enough to tune a single policy knob.

use crate::models::Quantity;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default prefix for workload annotations that describe implicit intents
pub const DEFAULT_ANNOTATION_PREFIX: &str = "intent.continuum.io/";

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Resource kinds and their fixed dimension order
    pub resources: Vec<ResourceKindConfig>,
    pub scoring: ScoringConfig,
    pub feedback: FeedbackConfig,
    pub rematch: RematchConfig,
    /// Allow higher-priority intents to revoke lower-priority bindings
    pub preemption_enabled: bool,
    pub annotation_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resources: default_resources(),
            scoring: ScoringConfig::default(),
            feedback: FeedbackConfig::default(),
            rematch: RematchConfig::default(),
            preemption_enabled: false,
            annotation_prefix: DEFAULT_ANNOTATION_PREFIX.to_string(),
        }
    }
}

/// Unit family of a resource kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitFamily {
    /// CPU cores; base unit is the nanocore
    Cores,
    /// Memory or storage; base unit is the byte, a unit suffix is required
    Bytes,
    /// Plain counts such as GPUs or FPGAs
    Count,
}

/// One resource dimension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceKindConfig {
    pub name: String,
    pub unit: UnitFamily,
    /// Normalization scale for slack features, in the kind's own units
    pub scale: Quantity,
}

impl ResourceKindConfig {
    pub fn new(name: impl Into<String>, unit: UnitFamily, scale: Quantity) -> Self {
        Self {
            name: name.into(),
            unit,
            scale,
        }
    }
}

fn default_resources() -> Vec<ResourceKindConfig> {
    vec![
        ResourceKindConfig::new("cpu", UnitFamily::Cores, Quantity::cores(1.0)),
        ResourceKindConfig::new("memory", UnitFamily::Bytes, Quantity::gib(1.0)),
        ResourceKindConfig::new("storage", UnitFamily::Bytes, Quantity::gib(10.0)),
        ResourceKindConfig::new("gpu", UnitFamily::Count, Quantity::count(1.0)),
    ]
}

/// Scoring function weights and learning policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Weight of the per-dimension slack term (must be non-negative)
    pub slack_weight: f64,
    pub cost_weight: f64,
    pub latency_weight: f64,
    /// Bonus for offers from the local cluster
    pub local_weight: f64,
    pub learning_rate: f64,
    pub accepted_reward: f64,
    pub rejected_penalty: f64,
    pub reclaimed_penalty: f64,
    /// Learned biases are clamped to `[-bias_limit, bias_limit]`
    pub bias_limit: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            slack_weight: 1.0,
            cost_weight: 0.1,
            latency_weight: 0.5,
            local_weight: 0.25,
            learning_rate: 0.1,
            accepted_reward: 0.2,
            rejected_penalty: 1.0,
            reclaimed_penalty: 0.5,
            bias_limit: 5.0,
        }
    }
}

/// Feedback batching policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Apply a batch as soon as this many records are pending
    pub batch_size: usize,
    pub flush_interval_secs: u64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            flush_interval_secs: 5,
        }
    }
}

impl FeedbackConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

/// Re-matching cadence for pending intents
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RematchConfig {
    /// Quiet period after a catalog change before a pass runs
    pub debounce_ms: u64,
    /// Safety-net sweep interval
    pub sweep_interval_secs: u64,
}

impl Default for RematchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 250,
            sweep_interval_secs: 30,
        }
    }
}

impl RematchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
