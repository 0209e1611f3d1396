//! Feedback records

use crate::allocation::Binding;
use crate::features::OfferVector;
use crate::models::{IntentId, OfferId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// What happened to a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Accepted,
    RejectedByOffer,
    Reclaimed,
}

impl FeedbackOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FeedbackOutcome::Accepted => "accepted",
            FeedbackOutcome::RejectedByOffer => "rejected_by_offer",
            FeedbackOutcome::Reclaimed => "reclaimed",
        }
    }
}

impl fmt::Display for FeedbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One allocation outcome, with the offer context the model learns from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    /// Digest of `(binding id, outcome)`; recording the same pair twice is a no-op
    pub id: String,
    pub binding_id: String,
    pub intent_id: IntentId,
    pub offer_id: OfferId,
    pub outcome: FeedbackOutcome,
    pub offer_region: String,
    pub offer_tags: BTreeSet<String>,
    pub recorded_at: DateTime<Utc>,
}

impl FeedbackRecord {
    pub fn new(binding: &Binding, offer: &OfferVector, outcome: FeedbackOutcome) -> Self {
        Self {
            id: record_id(&binding.id, outcome),
            binding_id: binding.id.clone(),
            intent_id: binding.intent_id.clone(),
            offer_id: binding.offer_id.clone(),
            outcome,
            offer_region: offer.locality.region.clone(),
            offer_tags: offer.tags.clone(),
            recorded_at: Utc::now(),
        }
    }
}

/// Deterministic record id for a binding outcome
pub fn record_id(binding_id: &str, outcome: FeedbackOutcome) -> String {
    let mut hasher = Sha256::new();
    hasher.update(binding_id.as_bytes());
    hasher.update(b":");
    hasher.update(outcome.label().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..24].to_string()
}
