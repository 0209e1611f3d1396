//! Engagement scoring
//!
//! A deterministic linear model over intent/offer features. Learned state
//! (region and tag biases) lives in versioned [`ScoringParameters`]
//! snapshots published by the [`ScoringModel`].

mod model;
mod parameters;
mod store;

pub use model::ScoringModel;
pub use parameters::ScoringParameters;
pub use store::ParameterStore;

use crate::features::{IntentVector, OfferVector};

/// Trait for engagement score implementations
pub trait ScoreFunction: Send + Sync {
    /// Higher is a better fit
    fn score(&self, intent: &IntentVector, offer: &OfferVector) -> f64;
}
