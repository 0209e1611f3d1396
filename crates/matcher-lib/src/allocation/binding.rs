//! Bindings between intents and offers

use crate::features::ResourceVector;
use crate::models::{IntentId, OfferId, PriorityTier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type BindingId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingStatus {
    /// Capacity reserved, waiting for the offering provider
    Provisional,
    Confirmed,
    Revoked,
}

/// Reserved capacity of one offer held by one intent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binding {
    pub id: BindingId,
    pub intent_id: IntentId,
    pub offer_id: OfferId,
    pub reserved: ResourceVector,
    pub priority: PriorityTier,
    pub status: BindingStatus,
    pub created_at: DateTime<Utc>,
}

impl Binding {
    pub fn provisional(
        id: BindingId,
        intent_id: IntentId,
        offer_id: OfferId,
        reserved: ResourceVector,
        priority: PriorityTier,
    ) -> Self {
        Self {
            id,
            intent_id,
            offer_id,
            reserved,
            priority,
            status: BindingStatus::Provisional,
            created_at: Utc::now(),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == BindingStatus::Confirmed
    }
}
