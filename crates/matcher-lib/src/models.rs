//! Core data models for the matching engine

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub type IntentId = String;
pub type OfferId = String;

/// A resource amount with its unit, e.g. `500m` CPU or `4Gi` memory
///
/// Deserializes from a Kubernetes-style string (`"4Gi"`), a bare number,
/// or `{ "amount": 4, "unit": "Gi" }`. Serializes back to the string form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "QuantityRepr", into = "String")]
pub struct Quantity {
    pub amount: f64,
    pub unit: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuantityRepr {
    Text(String),
    Number(f64),
    Parts {
        amount: f64,
        #[serde(default)]
        unit: String,
    },
}

impl TryFrom<QuantityRepr> for Quantity {
    type Error = EngineError;

    fn try_from(repr: QuantityRepr) -> EngineResult<Self> {
        match repr {
            QuantityRepr::Text(s) => s.parse(),
            QuantityRepr::Number(amount) => Ok(Quantity::new(amount, "")),
            QuantityRepr::Parts { amount, unit } => Ok(Quantity::new(amount, unit)),
        }
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.to_string()
    }
}

impl Quantity {
    pub fn new(amount: f64, unit: impl Into<String>) -> Self {
        Self {
            amount,
            unit: unit.into(),
        }
    }

    /// Whole CPU cores
    pub fn cores(amount: f64) -> Self {
        Self::new(amount, "")
    }

    pub fn millicores(amount: f64) -> Self {
        Self::new(amount, "m")
    }

    pub fn gib(amount: f64) -> Self {
        Self::new(amount, "Gi")
    }

    pub fn mib(amount: f64) -> Self {
        Self::new(amount, "Mi")
    }

    /// Unitless count, e.g. GPUs
    pub fn count(amount: f64) -> Self {
        Self::new(amount, "")
    }
}

impl FromStr for Quantity {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);

        if number.is_empty() {
            return Err(EngineError::invalid(format!(
                "quantity '{}' has no numeric part",
                s
            )));
        }

        let amount: f64 = number
            .parse()
            .map_err(|_| EngineError::invalid(format!("quantity '{}' is not a number", s)))?;

        // Decimal exponent (`1e3`, `5E-2`); a bare `E` stays the exa suffix
        if let Some(exponent) = unit
            .strip_prefix(|c: char| c == 'e' || c == 'E')
            .and_then(|e| e.parse::<i32>().ok())
        {
            return Ok(Quantity::new(amount * 10f64.powi(exponent), ""));
        }

        Ok(Quantity::new(amount, unit.trim()))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit)
    }
}

/// Where an offer lives in the continuum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locality {
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

impl Locality {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            zone: None,
        }
    }

    pub fn with_zone(region: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            zone: Some(zone.into()),
        }
    }

    /// Trimmed, lower-cased form used for matching; a blank zone is no zone
    pub fn normalized(&self) -> Self {
        Self {
            region: normalize_place(&self.region),
            zone: self
                .zone
                .as_deref()
                .map(normalize_place)
                .filter(|zone| !zone.is_empty()),
        }
    }
}

fn normalize_place(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Acceptable placements for an intent
///
/// Entries are either a region (`eu-west`) or a region and zone
/// (`eu-west/a`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalityConstraint {
    #[default]
    Any,
    OneOf(BTreeSet<String>),
}

impl LocalityConstraint {
    pub fn one_of<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LocalityConstraint::OneOf(entries.into_iter().map(Into::into).collect())
    }

    /// Entries trimmed and lower-cased, matching [`Locality::normalized`]
    pub fn normalized(&self) -> Self {
        match self {
            LocalityConstraint::Any => LocalityConstraint::Any,
            LocalityConstraint::OneOf(entries) => LocalityConstraint::OneOf(
                entries
                    .iter()
                    .map(|entry| match entry.split_once('/') {
                        Some((region, zone)) => {
                            format!("{}/{}", normalize_place(region), normalize_place(zone))
                        }
                        None => normalize_place(entry),
                    })
                    .collect(),
            ),
        }
    }

    /// Exact comparison; both sides are expected to be normalized
    pub fn admits(&self, locality: &Locality) -> bool {
        match self {
            LocalityConstraint::Any => true,
            LocalityConstraint::OneOf(entries) => entries.iter().any(|entry| {
                match entry.split_once('/') {
                    Some((region, zone)) => {
                        region == locality.region && locality.zone.as_deref() == Some(zone)
                    }
                    None => *entry == locality.region,
                }
            }),
        }
    }
}

/// Ordered priority tier; higher tiers win re-matching order and may preempt
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl FromStr for PriorityTier {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(PriorityTier::Low),
            "normal" => Ok(PriorityTier::Normal),
            "high" => Ok(PriorityTier::High),
            "critical" => Ok(PriorityTier::Critical),
            other => Err(EngineError::invalid(format!("unknown priority tier '{}'", other))),
        }
    }
}

/// Coarse network latency class of an offer (lower is better)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LatencyClass {
    Low,
    #[default]
    Medium,
    High,
}

impl LatencyClass {
    pub fn penalty(&self) -> f64 {
        match self {
            LatencyClass::Low => 0.0,
            LatencyClass::Medium => 1.0,
            LatencyClass::High => 2.0,
        }
    }
}

impl FromStr for LatencyClass {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(LatencyClass::Low),
            "medium" => Ok(LatencyClass::Medium),
            "high" => Ok(LatencyClass::High),
            other => Err(EngineError::invalid(format!("unknown latency class '{}'", other))),
        }
    }
}

/// Whether an offer comes from the local cluster or a remote peer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OfferOrigin {
    #[default]
    Local,
    Remote { cluster_id: String },
}

impl OfferOrigin {
    pub fn is_local(&self) -> bool {
        matches!(self, OfferOrigin::Local)
    }
}

/// A resource request as submitted by the reconciliation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentSpec {
    pub id: IntentId,
    pub requests: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub locality: LocalityConstraint,
    #[serde(default)]
    pub mandatory_tags: BTreeSet<String>,
    #[serde(default)]
    pub priority: PriorityTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency: Option<LatencyClass>,
}

impl IntentSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            requests: BTreeMap::new(),
            locality: LocalityConstraint::Any,
            mandatory_tags: BTreeSet::new(),
            priority: PriorityTier::Normal,
            max_latency: None,
        }
    }

    pub fn with_request(mut self, kind: impl Into<String>, quantity: Quantity) -> Self {
        self.requests.insert(kind.into(), quantity);
        self
    }

    pub fn with_locality(mut self, locality: LocalityConstraint) -> Self {
        self.locality = locality;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.mandatory_tags.insert(tag.into());
        self
    }

    pub fn with_priority(mut self, priority: PriorityTier) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_latency(mut self, latency: LatencyClass) -> Self {
        self.max_latency = Some(latency);
        self
    }
}

/// Capacity advertised by a node or cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferSpec {
    pub id: OfferId,
    pub capacity: BTreeMap<String, Quantity>,
    pub locality: Locality,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub cost_per_hour: f64,
    #[serde(default)]
    pub latency: LatencyClass,
    #[serde(default)]
    pub origin: OfferOrigin,
}

impl OfferSpec {
    pub fn new(id: impl Into<String>, locality: Locality) -> Self {
        Self {
            id: id.into(),
            capacity: BTreeMap::new(),
            locality,
            tags: BTreeSet::new(),
            cost_per_hour: 0.0,
            latency: LatencyClass::Medium,
            origin: OfferOrigin::Local,
        }
    }

    pub fn with_capacity(mut self, kind: impl Into<String>, quantity: Quantity) -> Self {
        self.capacity.insert(kind.into(), quantity);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_cost(mut self, cost_per_hour: f64) -> Self {
        self.cost_per_hour = cost_per_hour;
        self
    }

    pub fn with_latency(mut self, latency: LatencyClass) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_origin(mut self, origin: OfferOrigin) -> Self {
        self.origin = origin;
        self
    }
}

/// Lifecycle of an intent inside the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentState {
    Pending,
    Matched,
    Bound,
    Failed,
    Released,
}

/// Outcome of one `match` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "offer_id", rename_all = "snake_case")]
pub enum MatchResult {
    /// Committed to the given offer
    Bound(OfferId),
    /// No capacity right now; retried when the catalog changes
    Deferred,
    /// Structurally unsatisfiable without changing the intent
    Failed,
}

impl MatchResult {
    pub fn is_bound(&self) -> bool {
        matches!(self, MatchResult::Bound(_))
    }

    pub fn offer_id(&self) -> Option<&str> {
        match self {
            MatchResult::Bound(id) => Some(id),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MatchResult::Bound(_) => "bound",
            MatchResult::Deferred => "deferred",
            MatchResult::Failed => "failed",
        }
    }
}

/// Decision notification consumed by the reconciliation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub intent_id: IntentId,
    pub outcome: MatchResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Externally visible view of an intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentStatus {
    pub intent_id: IntentId,
    pub state: IntentState,
    pub priority: PriorityTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer_id: Option<OfferId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<MatchResult>,
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
}
