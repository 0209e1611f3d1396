//! Feature extraction for intents and offers
//!
//! Converts submitted intents and advertised offers into comparable vectors:
//! resource quantities in canonical base units laid out in the schema's
//! dimension order, plus the locality, tag, cost and latency context the
//! ranker and scoring model need.

mod units;
mod vector;

pub use units::{to_base_units, to_signed_base_units, ResourceKind, ResourceSchema};
pub use vector::ResourceVector;

use crate::error::{EngineError, EngineResult};
use crate::models::{
    IntentId, IntentSpec, LatencyClass, Locality, LocalityConstraint, OfferId, OfferSpec,
    PriorityTier, Quantity,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Extracted form of an intent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentVector {
    pub intent_id: IntentId,
    pub requested: ResourceVector,
    pub locality: LocalityConstraint,
    pub mandatory_tags: BTreeSet<String>,
    pub priority: PriorityTier,
    pub max_latency: Option<LatencyClass>,
}

impl IntentVector {
    /// Dimensions with a non-zero request
    pub fn requested_dims(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.requested.dims()).filter(|&d| self.requested.get(d) > 0)
    }
}

/// Extracted form of an offer, with its current remaining capacity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfferVector {
    pub offer_id: OfferId,
    pub advertised: ResourceVector,
    pub remaining: ResourceVector,
    pub locality: Locality,
    pub tags: BTreeSet<String>,
    pub cost_per_hour: f64,
    pub latency: LatencyClass,
    pub local: bool,
}

impl OfferVector {
    pub fn has_tags(&self, tags: &BTreeSet<String>) -> bool {
        tags.is_subset(&self.tags)
    }

    /// Remaining capacity left over after placing `requested`, per dimension
    pub fn slack(&self, requested: &ResourceVector) -> ResourceVector {
        let values = (0..self.remaining.dims())
            .map(|d| self.remaining.get(d).saturating_sub(requested.get(d)))
            .collect();
        ResourceVector::from_vec(values)
    }
}

/// Builds intent and offer vectors against one resource schema
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    schema: Arc<ResourceSchema>,
}

impl FeatureExtractor {
    pub fn new(schema: ResourceSchema) -> Self {
        Self {
            schema: Arc::new(schema),
        }
    }

    pub fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    pub fn extract_intent(&self, spec: &IntentSpec) -> EngineResult<IntentVector> {
        require_id("intent", &spec.id)?;

        let requested = self.quantities(&spec.requests)?;
        if requested.is_zero() {
            return Err(EngineError::invalid(format!(
                "intent {} requests no resources",
                spec.id
            )));
        }

        if let LocalityConstraint::OneOf(entries) = &spec.locality {
            if entries.is_empty() {
                return Err(EngineError::invalid(format!(
                    "intent {} has an empty locality set",
                    spec.id
                )));
            }
            if entries.iter().any(|e| e.trim().is_empty()) {
                return Err(EngineError::invalid(format!(
                    "intent {} has a blank locality entry",
                    spec.id
                )));
            }
        }

        Ok(IntentVector {
            intent_id: spec.id.clone(),
            requested,
            locality: spec.locality.normalized(),
            mandatory_tags: clean_tags(&spec.mandatory_tags)?,
            priority: spec.priority,
            max_latency: spec.max_latency,
        })
    }

    pub fn extract_offer(&self, spec: &OfferSpec) -> EngineResult<OfferVector> {
        require_id("offer", &spec.id)?;

        if spec.locality.region.trim().is_empty() {
            return Err(EngineError::invalid(format!(
                "offer {} has no region",
                spec.id
            )));
        }
        if !spec.cost_per_hour.is_finite() || spec.cost_per_hour < 0.0 {
            return Err(EngineError::invalid(format!(
                "offer {}: cost_per_hour {} must be a non-negative number",
                spec.id, spec.cost_per_hour
            )));
        }

        let advertised = self.quantities(&spec.capacity)?;

        Ok(OfferVector {
            offer_id: spec.id.clone(),
            remaining: advertised.clone(),
            advertised,
            locality: spec.locality.normalized(),
            tags: clean_tags(&spec.tags)?,
            cost_per_hour: spec.cost_per_hour,
            latency: spec.latency,
            local: spec.origin.is_local(),
        })
    }

    /// Signed per-dimension capacity change; unnamed kinds stay unchanged
    pub fn extract_delta(&self, delta: &BTreeMap<String, Quantity>) -> EngineResult<Vec<i64>> {
        let mut values = vec![0i64; self.schema.len()];
        for (name, quantity) in delta {
            let (dim, kind) = self.schema.kind(name)?;
            values[dim] = to_signed_base_units(&kind.name, kind.unit, quantity)?;
        }
        Ok(values)
    }

    fn quantities(&self, quantities: &BTreeMap<String, Quantity>) -> EngineResult<ResourceVector> {
        let mut vector = ResourceVector::zeros(self.schema.len());
        for (name, quantity) in quantities {
            let (dim, kind) = self.schema.kind(name)?;
            vector.set(dim, to_base_units(&kind.name, kind.unit, quantity)?);
        }
        Ok(vector)
    }
}

fn require_id(what: &str, id: &str) -> EngineResult<()> {
    if id.trim().is_empty() {
        return Err(EngineError::invalid(format!("{} id is empty", what)));
    }
    Ok(())
}

fn clean_tags(tags: &BTreeSet<String>) -> EngineResult<BTreeSet<String>> {
    tags.iter()
        .map(|t| {
            let t = t.trim();
            if t.is_empty() {
                Err(EngineError::invalid("tags must not be blank"))
            } else {
                Ok(t.to_string())
            }
        })
        .collect()
}
