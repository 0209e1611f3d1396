//! Candidate ranking
//!
//! Filters the offer catalog for one intent, scores survivors against a
//! single parameter snapshot, and orders them best-first with a total,
//! deterministic tie-break chain.

use crate::features::{IntentVector, OfferVector};
use crate::models::OfferId;
use crate::scoring::ScoreFunction;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// An offer that survived the hard filter, with its score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedOffer {
    pub offer_id: OfferId,
    pub score: f64,
    /// Total normalized capacity left after placing the intent
    pub spare_capacity: f64,
}

/// Why an offer was excluded for an intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterReason {
    /// Remaining capacity below the request in this dimension
    Capacity(usize),
    Locality,
    MissingTag(String),
    Latency,
}

impl FilterReason {
    fn label(&self) -> &'static str {
        match self {
            FilterReason::Capacity(_) => "capacity",
            FilterReason::Locality => "locality",
            FilterReason::MissingTag(_) => "tags",
            FilterReason::Latency => "latency",
        }
    }
}

/// Ranks offers for intents
#[derive(Debug, Clone)]
pub struct Ranker {
    scales: Vec<f64>,
}

impl Ranker {
    pub fn new(scales: Vec<f64>) -> Self {
        Self { scales }
    }

    /// Every constraint except remaining capacity
    pub fn admissible(&self, intent: &IntentVector, offer: &OfferVector) -> Option<FilterReason> {
        if !intent.locality.admits(&offer.locality) {
            return Some(FilterReason::Locality);
        }
        if let Some(tag) = intent.mandatory_tags.iter().find(|t| !offer.tags.contains(*t)) {
            return Some(FilterReason::MissingTag(tag.clone()));
        }
        if let Some(max) = intent.max_latency {
            if offer.latency > max {
                return Some(FilterReason::Latency);
            }
        }
        None
    }

    /// First reason the offer fails the hard filter, if any
    pub fn filter_reason(&self, intent: &IntentVector, offer: &OfferVector) -> Option<FilterReason> {
        if let Some(dim) = offer.remaining.first_shortfall(&intent.requested) {
            return Some(FilterReason::Capacity(dim));
        }
        self.admissible(intent, offer)
    }

    pub fn passes_hard_filter(&self, intent: &IntentVector, offer: &OfferVector) -> bool {
        self.filter_reason(intent, offer).is_none()
    }

    /// Filter, score and order offers best-first
    pub fn rank(
        &self,
        intent: &IntentVector,
        offers: &[OfferVector],
        scorer: &dyn ScoreFunction,
    ) -> Vec<RankedOffer> {
        let survivors = offers
            .iter()
            .filter(|offer| self.passes_hard_filter(intent, offer));
        self.order(intent, survivors, scorer)
    }

    /// Offers that would fit the intent if their current bindings were revoked
    pub fn preemption_candidates(
        &self,
        intent: &IntentVector,
        offers: &[OfferVector],
        scorer: &dyn ScoreFunction,
    ) -> Vec<RankedOffer> {
        let candidates = offers.iter().filter(|offer| {
            offer.advertised.covers(&intent.requested) && self.admissible(intent, offer).is_none()
        });
        self.order(intent, candidates, scorer)
    }

    /// The intent can never match without changing it: it names mandatory
    /// tags that no known offer carries together
    ///
    /// An empty catalog proves nothing, so it never makes an intent unsatisfiable.
    pub fn is_structurally_unsatisfiable(
        &self,
        intent: &IntentVector,
        offers: &[OfferVector],
    ) -> bool {
        !intent.mandatory_tags.is_empty()
            && !offers.is_empty()
            && !offers.iter().any(|o| o.has_tags(&intent.mandatory_tags))
    }

    /// Human-readable summary of why no offer passed the filter
    pub fn explain(&self, intent: &IntentVector, offers: &[OfferVector]) -> String {
        if offers.is_empty() {
            return "no offers advertised".to_string();
        }

        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for offer in offers {
            if let Some(reason) = self.filter_reason(intent, offer) {
                *counts.entry(reason.label()).or_default() += 1;
            }
        }

        if counts.is_empty() {
            return "all candidate offers were taken or declined".to_string();
        }

        let parts: Vec<String> = counts
            .iter()
            .map(|(label, n)| format!("{}={}", label, n))
            .collect();
        format!("offers filtered by {}", parts.join(", "))
    }

    fn order<'a>(
        &self,
        intent: &IntentVector,
        offers: impl Iterator<Item = &'a OfferVector>,
        scorer: &dyn ScoreFunction,
    ) -> Vec<RankedOffer> {
        let mut ranked: Vec<RankedOffer> = offers
            .map(|offer| RankedOffer {
                offer_id: offer.offer_id.clone(),
                score: scorer.score(intent, offer),
                spare_capacity: offer.slack(&intent.requested).normalized_total(&self.scales),
            })
            .collect();

        ranked.sort_by(compare_ranked);
        ranked
    }
}

/// Score descending, then spare capacity descending, then offer id ascending
fn compare_ranked(a: &RankedOffer, b: &RankedOffer) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.spare_capacity.total_cmp(&a.spare_capacity))
        .then_with(|| a.offer_id.cmp(&b.offer_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, ScoringConfig};
    use crate::features::{FeatureExtractor, ResourceSchema};
    use crate::models::{IntentSpec, LatencyClass, Locality, LocalityConstraint, OfferSpec, Quantity};
    use crate::scoring::ScoringParameters;

    struct Fixture {
        extractor: FeatureExtractor,
        params: ScoringParameters,
        ranker: Ranker,
    }

    fn fixture() -> Fixture {
        let schema = ResourceSchema::from_config(&EngineConfig::default().resources).unwrap();
        let params = ScoringParameters::initial(&schema, &ScoringConfig::default()).unwrap();
        Fixture {
            ranker: Ranker::new(schema.scales()),
            extractor: FeatureExtractor::new(schema),
            params,
        }
    }

    /// Scores every offer the same so the tie-break chain decides
    struct Flat;

    impl ScoreFunction for Flat {
        fn score(&self, _: &IntentVector, _: &OfferVector) -> f64 {
            1.0
        }
    }

    fn offer(f: &Fixture, spec: OfferSpec) -> OfferVector {
        f.extractor.extract_offer(&spec).unwrap()
    }

    fn cpu_offer(id: &str, region: &str, cpu: f64) -> OfferSpec {
        OfferSpec::new(id, Locality::new(region)).with_capacity("cpu", Quantity::cores(cpu))
    }

    fn cpu_intent(cpu: f64) -> IntentSpec {
        IntentSpec::new("i-1").with_request("cpu", Quantity::cores(cpu))
    }

    #[test]
    fn test_hard_filter() {
        let f = fixture();
        let intent = f
            .extractor
            .extract_intent(
                &cpu_intent(2.0)
                    .with_locality(LocalityConstraint::one_of(["eu-west"]))
                    .with_tag("ssd")
                    .with_max_latency(LatencyClass::Medium),
            )
            .unwrap();

        let good = offer(&f, cpu_offer("good", "eu-west", 4.0).with_tag("ssd"));
        let small = offer(&f, cpu_offer("small", "eu-west", 1.0).with_tag("ssd"));
        let far = offer(&f, cpu_offer("far", "us-east", 4.0).with_tag("ssd"));
        let untagged = offer(&f, cpu_offer("untagged", "eu-west", 4.0));
        let slow = offer(
            &f,
            cpu_offer("slow", "eu-west", 4.0)
                .with_tag("ssd")
                .with_latency(LatencyClass::High),
        );

        assert!(f.ranker.passes_hard_filter(&intent, &good));
        assert_eq!(f.ranker.filter_reason(&intent, &small), Some(FilterReason::Capacity(0)));
        assert_eq!(f.ranker.filter_reason(&intent, &far), Some(FilterReason::Locality));
        assert_eq!(
            f.ranker.filter_reason(&intent, &untagged),
            Some(FilterReason::MissingTag("ssd".into()))
        );
        assert_eq!(f.ranker.filter_reason(&intent, &slow), Some(FilterReason::Latency));

        let ranked = f
            .ranker
            .rank(&intent, &[good, small, far, untagged, slow], &f.params);
        let ids: Vec<_> = ranked.iter().map(|r| r.offer_id.as_str()).collect();
        assert_eq!(ids, vec!["good"]);
    }

    #[test]
    fn test_rank_orders_by_score() {
        let f = fixture();
        let intent = f.extractor.extract_intent(&cpu_intent(1.0)).unwrap();
        let offers = vec![
            offer(&f, cpu_offer("a", "eu-west", 2.0)),
            offer(&f, cpu_offer("b", "eu-west", 8.0)),
            offer(&f, cpu_offer("c", "eu-west", 4.0).with_cost(100.0)),
        ];

        let ranked = f.ranker.rank(&intent, &offers, &f.params);
        let ids: Vec<_> = ranked.iter().map(|r| r.offer_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_tie_break_chain() {
        let f = fixture();
        let intent = f.extractor.extract_intent(&cpu_intent(1.0)).unwrap();
        let offers = vec![
            offer(&f, cpu_offer("zeta", "eu-west", 4.0)),
            offer(&f, cpu_offer("alpha", "eu-west", 4.0)),
            offer(&f, cpu_offer("roomy", "eu-west", 16.0)),
        ];

        let ranked = f.ranker.rank(&intent, &offers, &Flat);
        let ids: Vec<_> = ranked.iter().map(|r| r.offer_id.as_str()).collect();
        assert_eq!(ids, vec!["roomy", "alpha", "zeta"]);
    }

    #[test]
    fn test_rank_is_deterministic_across_input_order() {
        let f = fixture();
        let intent = f.extractor.extract_intent(&cpu_intent(1.0)).unwrap();
        let mut offers: Vec<_> = (0..12)
            .map(|i| offer(&f, cpu_offer(&format!("o-{:02}", i), "eu-west", 2.0 + (i % 3) as f64)))
            .collect();

        let first = f.ranker.rank(&intent, &offers, &f.params);
        offers.reverse();
        let second = f.ranker.rank(&intent, &offers, &f.params);
        assert_eq!(first, second);
    }

    #[test]
    fn test_structurally_unsatisfiable() {
        let f = fixture();
        let intent = f
            .extractor
            .extract_intent(&cpu_intent(1.0).with_tag("gpu"))
            .unwrap();
        let plain = offer(&f, cpu_offer("a", "eu-west", 4.0));
        let gpu = offer(&f, cpu_offer("b", "eu-west", 0.5).with_tag("gpu"));

        assert!(f.ranker.is_structurally_unsatisfiable(&intent, &[plain.clone()]));
        assert!(!f.ranker.is_structurally_unsatisfiable(&intent, &[plain, gpu]));

        assert!(!f.ranker.is_structurally_unsatisfiable(&intent, &[]));

        let untagged = f.extractor.extract_intent(&cpu_intent(64.0)).unwrap();
        assert!(!f.ranker.is_structurally_unsatisfiable(&untagged, &[]));
    }

    #[test]
    fn test_preemption_candidates_use_advertised_capacity() {
        let f = fixture();
        let intent = f.extractor.extract_intent(&cpu_intent(3.0)).unwrap();
        let mut busy = offer(&f, cpu_offer("busy", "eu-west", 4.0));
        busy.remaining = crate::features::ResourceVector::zeros(4);
        let tiny = offer(&f, cpu_offer("tiny", "eu-west", 2.0));

        assert!(f.ranker.rank(&intent, &[busy.clone(), tiny.clone()], &f.params).is_empty());
        let candidates = f.ranker.preemption_candidates(&intent, &[busy, tiny], &f.params);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].offer_id, "busy");
    }

    #[test]
    fn test_explain() {
        let f = fixture();
        let intent = f.extractor.extract_intent(&cpu_intent(8.0)).unwrap();
        let offers = vec![offer(&f, cpu_offer("a", "eu-west", 4.0))];
        assert_eq!(f.ranker.explain(&intent, &offers), "offers filtered by capacity=1");
        assert_eq!(f.ranker.explain(&intent, &[]), "no offers advertised");
    }
}
