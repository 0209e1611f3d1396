//! Immutable scoring parameter snapshots

use super::ScoreFunction;
use crate::config::ScoringConfig;
use crate::error::{EngineError, EngineResult};
use crate::feedback::{FeedbackOutcome, FeedbackRecord};
use crate::features::{IntentVector, OfferVector, ResourceSchema};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One complete, versioned set of scoring parameters
///
/// Never mutated once published; learning produces a new snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringParameters {
    pub version: u64,
    /// Normalization scale per dimension, in base units
    pub dimension_scales: Vec<f64>,
    /// Non-negative slack weights; learning never touches these
    pub slack_weights: Vec<f64>,
    pub cost_weight: f64,
    pub latency_weight: f64,
    pub local_weight: f64,
    pub bias: f64,
    pub region_bias: BTreeMap<String, f64>,
    pub tag_bias: BTreeMap<String, f64>,
    pub samples_seen: u64,
    pub updated_at: DateTime<Utc>,
}

impl ScoringParameters {
    pub fn initial(schema: &ResourceSchema, config: &ScoringConfig) -> EngineResult<Self> {
        let params = Self {
            version: 1,
            dimension_scales: schema.scales(),
            slack_weights: vec![config.slack_weight; schema.len()],
            cost_weight: config.cost_weight,
            latency_weight: config.latency_weight,
            local_weight: config.local_weight,
            bias: 0.0,
            region_bias: BTreeMap::new(),
            tag_bias: BTreeMap::new(),
            samples_seen: 0,
            updated_at: Utc::now(),
        };
        params.validate(schema.len())?;
        Ok(params)
    }

    /// Check shape and numeric sanity against a schema of `dims` dimensions
    pub fn validate(&self, dims: usize) -> EngineResult<()> {
        if self.dimension_scales.len() != dims || self.slack_weights.len() != dims {
            return Err(EngineError::invalid(format!(
                "parameters have {} scales and {} slack weights, schema has {} dimensions",
                self.dimension_scales.len(),
                self.slack_weights.len(),
                dims
            )));
        }
        if self
            .dimension_scales
            .iter()
            .any(|s| !s.is_finite() || *s <= 0.0)
        {
            return Err(EngineError::invalid("dimension scales must be positive"));
        }
        if self.slack_weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EngineError::invalid("slack weights must be non-negative"));
        }

        let scalars = [self.cost_weight, self.latency_weight, self.local_weight, self.bias];
        let biases = self.region_bias.values().chain(self.tag_bias.values());
        if scalars.iter().chain(biases).any(|v| !v.is_finite()) {
            return Err(EngineError::invalid("scoring parameters must be finite"));
        }

        Ok(())
    }

    /// Derive the next snapshot from a feedback batch
    pub fn apply_feedback(&self, batch: &[FeedbackRecord], config: &ScoringConfig) -> Self {
        let mut next = self.clone();
        let limit = config.bias_limit.abs();

        for record in batch {
            let signal = match record.outcome {
                FeedbackOutcome::Accepted => config.accepted_reward,
                FeedbackOutcome::RejectedByOffer => -config.rejected_penalty,
                FeedbackOutcome::Reclaimed => -config.reclaimed_penalty,
            };
            let step = config.learning_rate * signal;

            nudge(&mut next.region_bias, &record.offer_region, step, limit);
            for tag in &record.offer_tags {
                nudge(&mut next.tag_bias, tag, step, limit);
            }
        }

        next.version = self.version + 1;
        next.samples_seen = self.samples_seen + batch.len() as u64;
        next.updated_at = Utc::now();
        next
    }

    fn slack_term(&self, intent: &IntentVector, offer: &OfferVector) -> f64 {
        intent
            .requested_dims()
            .map(|d| {
                let slack = offer.remaining.get(d).saturating_sub(intent.requested.get(d)) as f64;
                let scale = self.dimension_scales.get(d).copied().unwrap_or(1.0);
                let weight = self.slack_weights.get(d).copied().unwrap_or(0.0);
                weight * (slack / scale).ln_1p()
            })
            .sum()
    }
}

impl ScoreFunction for ScoringParameters {
    fn score(&self, intent: &IntentVector, offer: &OfferVector) -> f64 {
        let mut score = self.bias + self.slack_term(intent, offer);

        score -= self.cost_weight * offer.cost_per_hour;
        score -= self.latency_weight * offer.latency.penalty();
        if offer.local {
            score += self.local_weight;
        }

        score += self
            .region_bias
            .get(&offer.locality.region)
            .copied()
            .unwrap_or(0.0);
        score += offer
            .tags
            .iter()
            .filter_map(|tag| self.tag_bias.get(tag))
            .sum::<f64>();

        score
    }
}

fn nudge(biases: &mut BTreeMap<String, f64>, key: &str, step: f64, limit: f64) {
    let entry = biases.entry(key.to_string()).or_insert(0.0);
    *entry = (*entry + step).clamp(-limit, limit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::Binding;
    use crate::config::EngineConfig;
    use crate::features::FeatureExtractor;
    use crate::models::{IntentSpec, LatencyClass, Locality, OfferSpec, PriorityTier, Quantity};

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(ResourceSchema::from_config(&EngineConfig::default().resources).unwrap())
    }

    fn params() -> ScoringParameters {
        ScoringParameters::initial(extractor().schema(), &ScoringConfig::default()).unwrap()
    }

    fn offer(id: &str, cpu: f64) -> OfferVector {
        extractor()
            .extract_offer(
                &OfferSpec::new(id, Locality::new("eu-west"))
                    .with_capacity("cpu", Quantity::cores(cpu))
                    .with_tag("ssd"),
            )
            .unwrap()
    }

    fn intent() -> IntentVector {
        extractor()
            .extract_intent(&IntentSpec::new("i-1").with_request("cpu", Quantity::cores(1.0)))
            .unwrap()
    }

    fn record(outcome: FeedbackOutcome) -> FeedbackRecord {
        let binding = Binding::provisional(
            "bnd-1".into(),
            "i-1".into(),
            "o-1".into(),
            intent().requested,
            PriorityTier::Normal,
        );
        FeedbackRecord::new(&binding, &offer("o-1", 4.0), outcome)
    }

    #[test]
    fn test_score_monotonic_in_slack() {
        let p = params();
        let i = intent();
        let small = p.score(&i, &offer("small", 2.0));
        let large = p.score(&i, &offer("large", 8.0));
        assert!(large > small);
    }

    #[test]
    fn test_score_penalizes_cost_and_latency() {
        let p = params();
        let i = intent();
        let base = offer("o", 4.0);

        let mut expensive = base.clone();
        expensive.cost_per_hour = 5.0;
        assert!(p.score(&i, &expensive) < p.score(&i, &base));

        let mut slow = base.clone();
        slow.latency = LatencyClass::High;
        assert!(p.score(&i, &slow) < p.score(&i, &base));

        let mut remote = base.clone();
        remote.local = false;
        assert!(p.score(&i, &remote) < p.score(&i, &base));
    }

    #[test]
    fn test_score_is_deterministic() {
        let p = params();
        let i = intent();
        let o = offer("o", 4.0);
        assert_eq!(p.score(&i, &o).to_bits(), p.score(&i, &o).to_bits());
    }

    #[test]
    fn test_apply_feedback_adjusts_biases() {
        let config = ScoringConfig::default();
        let p = params();

        let next = p.apply_feedback(&[record(FeedbackOutcome::RejectedByOffer)], &config);
        assert_eq!(next.version, p.version + 1);
        assert_eq!(next.samples_seen, 1);
        assert!(next.region_bias["eu-west"] < 0.0);
        assert!(next.tag_bias["ssd"] < 0.0);
        assert_eq!(next.slack_weights, p.slack_weights);

        let accepted = p.apply_feedback(&[record(FeedbackOutcome::Accepted)], &config);
        assert!(accepted.region_bias["eu-west"] > 0.0);
    }

    #[test]
    fn test_biases_are_clamped() {
        let config = ScoringConfig {
            learning_rate: 10.0,
            bias_limit: 2.0,
            ..ScoringConfig::default()
        };
        let batch: Vec<_> = (0..10).map(|_| record(FeedbackOutcome::RejectedByOffer)).collect();
        let next = params().apply_feedback(&batch, &config);
        assert_eq!(next.region_bias["eu-west"], -2.0);
    }

    #[test]
    fn test_validate_rejects_negative_slack_weight() {
        let mut p = params();
        p.slack_weights[0] = -1.0;
        assert!(p.validate(4).is_err());
        assert!(params().validate(3).is_err());
        assert!(params().validate(4).is_ok());
    }
}
