//! Coordinator tests
//!
//! These tests verify:
//! - Commit, fallback and rejection handling
//! - Intent and offer withdrawal
//! - Preemption by higher tiers
//! - Decision events and re-matching

use super::*;
use crate::annotations::AnnotationParser;
use crate::config::{EngineConfig, DEFAULT_ANNOTATION_PREFIX};
use crate::error::EngineError;
use crate::features::OfferVector;
use crate::feedback::FeedbackOutcome;
use crate::models::{
    IntentSpec, IntentState, Locality, MatchResult, OfferSpec, PriorityTier, Quantity,
};
use std::collections::BTreeMap;
use std::sync::Arc;

const CORE: u64 = 1_000_000_000;

fn coordinator() -> Coordinator {
    Coordinator::new(EngineConfig::default()).unwrap()
}

fn preempting_coordinator() -> Coordinator {
    let config = EngineConfig {
        preemption_enabled: true,
        ..EngineConfig::default()
    };
    Coordinator::new(config).unwrap()
}

fn offer(id: &str, cpu: f64, cost: f64) -> OfferSpec {
    OfferSpec::new(id, Locality::new("eu-west"))
        .with_capacity("cpu", Quantity::cores(cpu))
        .with_capacity("memory", Quantity::gib(16.0))
        .with_cost(cost)
}

fn intent(id: &str, cpu: f64) -> IntentSpec {
    IntentSpec::new(id).with_request("cpu", Quantity::cores(cpu))
}

mod submit_tests {
    use super::*;

    #[test]
    fn test_submit_binds_best_offer() {
        let coordinator = coordinator();
        coordinator.advertise(offer("pricey", 4.0, 5.0)).unwrap();
        coordinator.advertise(offer("cheap", 4.0, 1.0)).unwrap();

        let result = coordinator.submit(intent("i-1", 2.0)).unwrap();
        assert_eq!(result, MatchResult::Bound("cheap".to_string()));

        let status = coordinator.intent_status("i-1").unwrap();
        assert_eq!(status.state, IntentState::Bound);
        assert_eq!(status.offer_id.as_deref(), Some("cheap"));
        assert_eq!(status.attempts, 1);

        let cheap = coordinator.offer("cheap").unwrap();
        assert_eq!(cheap.remaining.get(0), 2 * CORE);
        assert!(coordinator.audit_capacity().is_clean());
    }

    #[test]
    fn test_duplicate_intent_rejected() {
        let coordinator = coordinator();
        coordinator.submit(intent("i-1", 1.0)).unwrap();

        let err = coordinator.submit(intent("i-1", 1.0)).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateIntent(id) if id == "i-1"));
    }

    #[test]
    fn test_invalid_intent_not_registered() {
        let coordinator = coordinator();

        let err = coordinator.submit(IntentSpec::new("empty")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert!(matches!(
            coordinator.intent_status("empty"),
            Err(EngineError::IntentNotFound(_))
        ));
    }

    #[test]
    fn test_no_offers_defers() {
        let coordinator = coordinator();

        let result = coordinator.submit(intent("i-1", 1.0)).unwrap();
        assert_eq!(result, MatchResult::Deferred);

        let status = coordinator.intent_status("i-1").unwrap();
        assert_eq!(status.state, IntentState::Pending);
        assert_eq!(status.last_outcome, Some(MatchResult::Deferred));
        assert_eq!(coordinator.pending_count(), 1);
    }

    #[test]
    fn test_match_on_bound_intent_keeps_binding() {
        let coordinator = coordinator();
        coordinator.advertise(offer("a", 4.0, 1.0)).unwrap();
        coordinator.submit(intent("i-1", 1.0)).unwrap();

        let again = coordinator.match_intent("i-1").unwrap();
        assert_eq!(again, MatchResult::Bound("a".to_string()));
        assert_eq!(coordinator.bindings().len(), 1);
        assert_eq!(coordinator.intent_status("i-1").unwrap().attempts, 1);
    }

    #[test]
    fn test_failed_is_terminal() {
        let coordinator = coordinator();
        coordinator.advertise(offer("plain", 4.0, 1.0)).unwrap();

        let result = coordinator
            .submit(intent("i-1", 1.0).with_tag("gpu"))
            .unwrap();
        assert_eq!(result, MatchResult::Failed);

        coordinator
            .advertise(offer("accelerated", 4.0, 1.0).with_tag("gpu"))
            .unwrap();
        assert_eq!(coordinator.match_intent("i-1").unwrap(), MatchResult::Failed);
        assert_eq!(coordinator.intent_status("i-1").unwrap().state, IntentState::Failed);
        assert!(coordinator.bindings().is_empty());
    }

    #[test]
    fn test_annotated_location_matches_mixed_case_region() {
        let coordinator = coordinator();
        coordinator
            .advertise(
                OfferSpec::new("edge", Locality::new("EU-West"))
                    .with_capacity("cpu", Quantity::cores(4.0)),
            )
            .unwrap();

        let parser = AnnotationParser::new(DEFAULT_ANNOTATION_PREFIX);
        let annotations = BTreeMap::from([
            (format!("{}location", DEFAULT_ANNOTATION_PREFIX), "EU-West".to_string()),
            (format!("{}cpu", DEFAULT_ANNOTATION_PREFIX), "1".to_string()),
        ]);
        let spec = parser.parse("web", &annotations).unwrap();

        assert_eq!(
            coordinator.submit(spec).unwrap(),
            MatchResult::Bound("edge".to_string())
        );
    }

    #[test]
    fn test_missing_tag_with_empty_catalog_defers() {
        let coordinator = coordinator();

        let result = coordinator
            .submit(intent("i-1", 1.0).with_tag("gpu"))
            .unwrap();
        assert_eq!(result, MatchResult::Deferred);
    }
}

mod acceptance_tests {
    use super::*;

    #[test]
    fn test_rejection_falls_back_down_ranking() {
        let coordinator = Coordinator::builder(EngineConfig::default())
            .acceptor(Arc::new(|offer: &OfferVector, _: &Binding| {
                offer.offer_id != "cheap"
            }))
            .build()
            .unwrap();
        coordinator.advertise(offer("cheap", 4.0, 1.0)).unwrap();
        coordinator.advertise(offer("pricey", 4.0, 5.0)).unwrap();

        let result = coordinator.submit(intent("i-1", 2.0)).unwrap();
        assert_eq!(result, MatchResult::Bound("pricey".to_string()));

        let cheap = coordinator.offer("cheap").unwrap();
        assert_eq!(cheap.remaining, cheap.advertised);

        let outcomes: Vec<FeedbackOutcome> = coordinator
            .recorder()
            .records_for("i-1")
            .into_iter()
            .map(|r| r.outcome)
            .collect();
        assert!(outcomes.contains(&FeedbackOutcome::RejectedByOffer));
        assert!(outcomes.contains(&FeedbackOutcome::Accepted));
        assert!(coordinator.audit_capacity().is_clean());
    }

    #[test]
    fn test_all_rejected_defers() {
        let coordinator = Coordinator::builder(EngineConfig::default())
            .acceptor(Arc::new(|_: &OfferVector, _: &Binding| false))
            .build()
            .unwrap();
        coordinator.advertise(offer("a", 4.0, 1.0)).unwrap();
        coordinator.advertise(offer("b", 4.0, 2.0)).unwrap();

        let result = coordinator.submit(intent("i-1", 1.0)).unwrap();
        assert_eq!(result, MatchResult::Deferred);
        assert!(coordinator.bindings().is_empty());
        assert_eq!(coordinator.recorder().records_for("i-1").len(), 2);
        assert_eq!(coordinator.intent_status("i-1").unwrap().state, IntentState::Pending);
    }
}

mod withdrawal_tests {
    use super::*;

    #[test]
    fn test_withdraw_bound_intent_reclaims_capacity() {
        let coordinator = coordinator();
        coordinator.advertise(offer("a", 4.0, 1.0)).unwrap();
        coordinator.submit(intent("i-1", 3.0)).unwrap();
        assert_eq!(
            coordinator.submit(intent("i-2", 3.0)).unwrap(),
            MatchResult::Deferred
        );
        let epoch_before = *coordinator.catalog_changes().borrow();

        coordinator.withdraw_intent("i-1").unwrap();

        let a = coordinator.offer("a").unwrap();
        assert_eq!(a.remaining, a.advertised);
        assert!(coordinator.bindings().is_empty());
        assert!(*coordinator.catalog_changes().borrow() > epoch_before);
        assert!(coordinator
            .recorder()
            .records_for("i-1")
            .iter()
            .any(|r| r.outcome == FeedbackOutcome::Reclaimed));
        assert!(matches!(
            coordinator.intent_status("i-1"),
            Err(EngineError::IntentNotFound(_))
        ));

        // The second intent only fits on the reclaimed capacity
        let summary = coordinator.rematch_pending();
        assert_eq!(summary.bound, 1);
        assert_eq!(
            coordinator.intent_status("i-2").unwrap().offer_id.as_deref(),
            Some("a")
        );
    }

    #[test]
    fn test_withdraw_offer_returns_intents_to_pending() {
        let coordinator = coordinator();
        coordinator.advertise(offer("a", 4.0, 1.0)).unwrap();
        coordinator.submit(intent("i-1", 3.0)).unwrap();
        assert_eq!(
            coordinator.submit(intent("i-2", 3.0)).unwrap(),
            MatchResult::Deferred
        );

        let displaced = coordinator.withdraw_offer("a").unwrap();
        assert_eq!(displaced, vec!["i-1".to_string()]);
        assert!(coordinator.offers().is_empty());
        assert!(coordinator.bindings().is_empty());

        let status = coordinator.intent_status("i-1").unwrap();
        assert_eq!(status.state, IntentState::Pending);
        assert!(status.offer_id.is_none());

        // Re-advertised with the same capacity, the offer takes the first
        // intent back and still has no room for the second
        coordinator.advertise(offer("a", 4.0, 1.0)).unwrap();
        let summary = coordinator.rematch_pending();
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.bound, 1);
        assert_eq!(
            coordinator.intent_status("i-1").unwrap().offer_id.as_deref(),
            Some("a")
        );
        assert_eq!(
            coordinator.intent_status("i-2").unwrap().state,
            IntentState::Pending
        );
        assert_eq!(coordinator.pending_count(), 1);
    }

    #[test]
    fn test_withdraw_unknown_ids() {
        let coordinator = coordinator();
        assert!(matches!(
            coordinator.withdraw_intent("nope"),
            Err(EngineError::IntentNotFound(_))
        ));
        assert!(matches!(
            coordinator.withdraw_offer("nope"),
            Err(EngineError::OfferNotFound(_))
        ));
    }

    #[test]
    fn test_readvertise_after_withdrawal() {
        let coordinator = coordinator();
        coordinator.advertise(offer("a", 4.0, 1.0)).unwrap();
        assert!(matches!(
            coordinator.advertise(offer("a", 4.0, 1.0)),
            Err(EngineError::DuplicateOffer(_))
        ));

        coordinator.withdraw_offer("a").unwrap();
        coordinator.advertise(offer("a", 8.0, 1.0)).unwrap();
        assert_eq!(coordinator.offer("a").unwrap().advertised.get(0), 8 * CORE);
    }
}

mod preemption_tests {
    use super::*;

    #[test]
    fn test_higher_tier_preempts_lower() {
        let coordinator = preempting_coordinator();
        coordinator.advertise(offer("a", 4.0, 1.0)).unwrap();
        coordinator
            .submit(intent("batch", 3.0).with_priority(PriorityTier::Low))
            .unwrap();
        let mut events = coordinator.subscribe();

        let result = coordinator
            .submit(intent("urgent", 2.0).with_priority(PriorityTier::High))
            .unwrap();
        assert_eq!(result, MatchResult::Bound("a".to_string()));

        let victim = coordinator.intent_status("batch").unwrap();
        assert_eq!(victim.state, IntentState::Pending);
        assert!(victim.binding_id.is_none());

        let bindings = coordinator.bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].intent_id, "urgent");
        assert_eq!(coordinator.offer("a").unwrap().remaining.get(0), 2 * CORE);
        assert!(coordinator.audit_capacity().is_clean());

        let mut deferred_reason = None;
        while let Ok(event) = events.try_recv() {
            if event.intent_id == "batch" {
                deferred_reason = event.reason;
            }
        }
        assert_eq!(deferred_reason.as_deref(), Some("preempted by urgent"));
    }

    #[test]
    fn test_preemption_disabled_defers() {
        let coordinator = coordinator();
        coordinator.advertise(offer("a", 4.0, 1.0)).unwrap();
        coordinator
            .submit(intent("batch", 3.0).with_priority(PriorityTier::Low))
            .unwrap();

        let result = coordinator
            .submit(intent("urgent", 2.0).with_priority(PriorityTier::High))
            .unwrap();
        assert_eq!(result, MatchResult::Deferred);
        assert_eq!(coordinator.intent_status("batch").unwrap().state, IntentState::Bound);
    }

    #[test]
    fn test_equal_tier_is_never_preempted() {
        let coordinator = preempting_coordinator();
        coordinator.advertise(offer("a", 4.0, 1.0)).unwrap();
        coordinator.submit(intent("first", 3.0)).unwrap();

        let result = coordinator.submit(intent("second", 2.0)).unwrap();
        assert_eq!(result, MatchResult::Deferred);
        assert_eq!(coordinator.intent_status("first").unwrap().state, IntentState::Bound);
    }

    #[test]
    fn test_request_larger_than_offer_is_not_preempted() {
        let coordinator = preempting_coordinator();
        coordinator.advertise(offer("a", 4.0, 1.0)).unwrap();
        coordinator
            .submit(intent("batch", 1.0).with_priority(PriorityTier::Low))
            .unwrap();

        let result = coordinator
            .submit(intent("huge", 8.0).with_priority(PriorityTier::Critical))
            .unwrap();
        assert_eq!(result, MatchResult::Deferred);
        assert_eq!(coordinator.intent_status("batch").unwrap().state, IntentState::Bound);
    }
}

mod decision_tests {
    use super::*;

    #[test]
    fn test_every_explicit_match_publishes_an_event() {
        let coordinator = coordinator();
        let mut events = coordinator.subscribe();

        coordinator.submit(intent("i-1", 2.0)).unwrap();
        coordinator.match_intent("i-1").unwrap();

        let first = events.try_recv().unwrap();
        let second = events.try_recv().unwrap();
        assert_eq!(first.outcome, MatchResult::Deferred);
        assert_eq!(first.reason.as_deref(), Some("no offers advertised"));
        assert_eq!(second.outcome, MatchResult::Deferred);
        assert!(events.try_recv().is_err());

        coordinator.advertise(offer("a", 4.0, 1.0)).unwrap();
        coordinator.match_intent("i-1").unwrap();
        coordinator.match_intent("i-1").unwrap();
        for _ in 0..2 {
            let bound = events.try_recv().unwrap();
            assert_eq!(bound.intent_id, "i-1");
            assert_eq!(bound.outcome, MatchResult::Bound("a".to_string()));
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_rematch_publishes_only_changes() {
        let coordinator = coordinator();
        coordinator.submit(intent("i-1", 2.0)).unwrap();
        let mut events = coordinator.subscribe();

        coordinator.rematch_pending();
        coordinator.rematch_pending();
        assert!(events.try_recv().is_err());

        coordinator.advertise(offer("a", 4.0, 1.0)).unwrap();
        coordinator.rematch_pending();
        let bound = events.try_recv().unwrap();
        assert_eq!(bound.intent_id, "i-1");
        assert_eq!(bound.outcome, MatchResult::Bound("a".to_string()));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_rematch_orders_by_priority_then_submission() {
        let coordinator = coordinator();
        coordinator
            .submit(intent("low", 2.0).with_priority(PriorityTier::Low))
            .unwrap();
        coordinator.submit(intent("normal", 2.0)).unwrap();
        coordinator
            .submit(intent("high-1", 2.0).with_priority(PriorityTier::High))
            .unwrap();
        coordinator
            .submit(intent("high-2", 2.0).with_priority(PriorityTier::High))
            .unwrap();

        coordinator.advertise(offer("a", 2.0, 1.0)).unwrap();
        let summary = coordinator.rematch_pending();

        assert_eq!(
            summary,
            RematchSummary {
                attempted: 4,
                bound: 1,
                deferred: 3,
                failed: 0,
            }
        );
        assert_eq!(coordinator.intent_status("high-1").unwrap().state, IntentState::Bound);
        assert_eq!(coordinator.pending_count(), 3);
    }

    #[test]
    fn test_rematch_pass_over_many_pending_intents() {
        let coordinator = coordinator();
        for i in 0..500 {
            coordinator.submit(intent(&format!("i-{:03}", i), 1.0)).unwrap();
        }
        coordinator.advertise(offer("a", 10.0, 1.0)).unwrap();

        let summary = coordinator.rematch_pending();
        assert_eq!(summary.attempted, 500);
        assert_eq!(summary.bound, 10);
        assert_eq!(summary.deferred, 490);
        assert_eq!(coordinator.pending_count(), 490);
        assert_eq!(coordinator.intent_status("i-000").unwrap().state, IntentState::Bound);
        assert_eq!(coordinator.intent_status("i-010").unwrap().state, IntentState::Pending);
    }
}

mod capacity_tests {
    use super::*;

    #[test]
    fn test_update_capacity_signals_and_enables_match() {
        let coordinator = coordinator();
        coordinator.advertise(offer("a", 2.0, 1.0)).unwrap();
        assert_eq!(coordinator.submit(intent("i-1", 3.0)).unwrap(), MatchResult::Deferred);

        let mut changes = coordinator.catalog_changes();
        changes.borrow_and_update();

        let delta = BTreeMap::from([("cpu".to_string(), Quantity::cores(2.0))]);
        let updated = coordinator.update_capacity("a", &delta).unwrap();
        assert_eq!(updated.advertised.get(0), 4 * CORE);
        assert!(changes.has_changed().unwrap());

        assert_eq!(coordinator.rematch_pending().bound, 1);
    }

    #[test]
    fn test_update_capacity_cannot_drop_below_reserved() {
        let coordinator = coordinator();
        coordinator.advertise(offer("a", 4.0, 1.0)).unwrap();
        coordinator.submit(intent("i-1", 3.0)).unwrap();

        let shrink = BTreeMap::from([("cpu".to_string(), Quantity::cores(-2.0))]);
        assert!(matches!(
            coordinator.update_capacity("a", &shrink),
            Err(EngineError::InvalidInput(_))
        ));

        let trim = BTreeMap::from([("cpu".to_string(), Quantity::cores(-1.0))]);
        let offer = coordinator.update_capacity("a", &trim).unwrap();
        assert_eq!(offer.remaining.get(0), 0);
        assert!(coordinator.audit_capacity().is_clean());
    }

    #[test]
    fn test_update_capacity_unknown_kind() {
        let coordinator = coordinator();
        coordinator.advertise(offer("a", 4.0, 1.0)).unwrap();

        let delta = BTreeMap::from([("fpga".to_string(), Quantity::count(1.0))]);
        assert!(matches!(
            coordinator.update_capacity("a", &delta),
            Err(EngineError::InvalidInput(_))
        ));
    }
}

mod rematch_worker_tests {
    use super::*;
    use crate::health::HealthRegistry;
    use std::time::Duration;
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn test_worker_rematches_after_catalog_change() {
        let mut config = EngineConfig::default();
        config.rematch.debounce_ms = 10;
        config.rematch.sweep_interval_secs = 3600;

        let coordinator = Arc::new(Coordinator::new(config.clone()).unwrap());
        assert_eq!(coordinator.submit(intent("i-1", 1.0)).unwrap(), MatchResult::Deferred);
        let mut events = coordinator.subscribe();

        let worker = Arc::new(RematchWorker::new(
            coordinator.clone(),
            config.rematch.clone(),
            HealthRegistry::new(),
        ));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(worker.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        coordinator.advertise(offer("a", 2.0, 1.0)).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("re-match did not run")
            .unwrap();
        assert_eq!(event.intent_id, "i-1");
        assert_eq!(event.outcome, MatchResult::Bound("a".to_string()));

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_pass_reports_summary() {
        let coordinator = Arc::new(coordinator());
        coordinator.submit(intent("i-1", 1.0)).unwrap();
        coordinator.submit(intent("i-2", 1.0)).unwrap();
        coordinator.advertise(offer("a", 1.0, 1.0)).unwrap();

        let worker = RematchWorker::new(
            coordinator.clone(),
            EngineConfig::default().rematch,
            HealthRegistry::new(),
        );
        let summary = worker.pass("test").await;

        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.bound, 1);
        assert_eq!(summary.deferred, 1);
    }
}
