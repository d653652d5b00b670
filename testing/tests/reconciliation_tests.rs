//! Merge-policy scenarios and properties of the reconciliation engine

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use allocation_sync_core::normalizer::{self, MalformedEventError};
use allocation_sync_core::{
    DiscardReason, InventoryRecord, InventoryStore, ReconcileOutcome, ReconciliationEngine,
    StoreError,
};
use allocation_sync_testing::properties::{arb_intent, arb_intents_for};
use allocation_sync_testing::{
    InMemoryInventoryStore, ReconcileTestHarness, envelope_json, intent, raw_record,
};
use allocation_sync_core::envelope::RawRecord;
use proptest::prelude::*;
use std::sync::Arc;

#[tokio::test]
async fn scenario_first_update_inserts() {
    let mut harness = ReconcileTestHarness::new();

    harness
        .when_intent(intent("P1", 10, 1000))
        .await
        .unwrap()
        .then_record(InventoryRecord::new("P1", 10, 1000))
        .then_last_outcome_is("inserted");
}

#[tokio::test]
async fn scenario_newer_update_replaces() {
    let mut harness = ReconcileTestHarness::new();

    harness
        .given_record(InventoryRecord::new("P1", 10, 1000))
        .when_intent(intent("P1", 25, 2000))
        .await
        .unwrap()
        .then_record(InventoryRecord::new("P1", 25, 2000))
        .then_last_outcome_is("updated");
}

#[tokio::test]
async fn scenario_stale_update_is_discarded() {
    let mut harness = ReconcileTestHarness::new();

    harness
        .given_record(InventoryRecord::new("P1", 25, 2000))
        .when_intent(intent("P1", 99, 1500))
        .await
        .unwrap()
        .then_record(InventoryRecord::new("P1", 25, 2000));

    assert_eq!(
        harness.outcomes(),
        &[ReconcileOutcome::Discarded { reason: DiscardReason::Stale }]
    );
    assert_eq!(harness.store().write_calls(), 0);
}

#[tokio::test]
async fn scenario_equal_timestamp_is_a_no_op() {
    let mut harness = ReconcileTestHarness::new();

    harness
        .given_record(InventoryRecord::new("P1", 25, 2000))
        .when_intent(intent("P1", 99, 2000))
        .await
        .unwrap()
        .then_record(InventoryRecord::new("P1", 25, 2000));

    assert_eq!(
        harness.outcomes(),
        &[ReconcileOutcome::Discarded { reason: DiscardReason::AlreadyApplied }]
    );
    assert_eq!(harness.store().write_calls(), 0);
}

#[tokio::test]
async fn scenario_malformed_timestamp_never_reaches_store() {
    let store = Arc::new(InMemoryInventoryStore::new());
    let engine = ReconciliationEngine::new(Arc::clone(&store));
    let payload = envelope_json(vec![RawRecord::new("P1", "10", "not-a-date")]);

    let envelope = normalizer::parse_envelope(Some(payload.as_slice())).unwrap();
    let mut applied = 0;
    let mut failure = None;
    for item in normalizer::intents(envelope.as_ref()) {
        match item {
            Ok(intent) => {
                engine.reconcile(&intent).await.unwrap();
                applied += 1;
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    assert_eq!(applied, 0);
    assert!(matches!(
        failure,
        Some(MalformedEventError::Entry { field: "allocationTimestamp", .. })
    ));
    assert_eq!(store.get_calls(), 0);
    assert_eq!(store.write_calls(), 0);
    assert!(store.is_empty());
}

#[tokio::test]
async fn replayed_intent_does_not_rewrite_store() {
    let mut harness = ReconcileTestHarness::new();

    harness
        .when_intents([intent("P1", 10, 1000), intent("P1", 10, 1000)])
        .await
        .unwrap()
        .then_record(InventoryRecord::new("P1", 10, 1000));

    assert_eq!(harness.store().write_calls(), 1);
}

#[tokio::test]
async fn store_outage_propagates_and_leaves_state_untouched() {
    let mut harness = ReconcileTestHarness::new();
    harness.given_record(InventoryRecord::new("P1", 10, 1000));
    harness.store().set_unavailable(true);

    let err = harness.when_intent(intent("P1", 25, 2000)).await.err();

    assert!(matches!(err, Some(StoreError::Unavailable(_))));
    harness.store().set_unavailable(false);
    harness.then_record(InventoryRecord::new("P1", 10, 1000));
}

#[tokio::test]
async fn independent_products_do_not_interact() {
    let mut harness = ReconcileTestHarness::new();

    harness
        .when_intents([
            intent("P1", 10, 1000),
            intent("P2", 5, 3000),
            intent("P1", 11, 900),
            intent("P2", 6, 3001),
        ])
        .await
        .unwrap()
        .then_record(InventoryRecord::new("P1", 10, 1000))
        .then_record(InventoryRecord::new("P2", 6, 3001));
}

#[tokio::test]
async fn concurrent_reconciliations_converge_on_latest() {
    let store = Arc::new(InMemoryInventoryStore::new());
    let engine = Arc::new(ReconciliationEngine::new(Arc::clone(&store)));

    let handles: Vec<_> = (0..32_i64)
        .map(|t| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                #[allow(clippy::cast_sign_loss)]
                let allocation = (t * 10) as u64;
                engine.reconcile(&intent("P1", allocation, t)).await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(store.record("P1"), Some(InventoryRecord::new("P1", 310, 31)));
}

#[tokio::test]
async fn normalized_payload_feeds_engine() {
    let store = Arc::new(InMemoryInventoryStore::new());
    let engine = ReconciliationEngine::new(Arc::clone(&store));
    let payload = envelope_json(vec![
        raw_record("P1", "10", 1000),
        raw_record("P1", "25", 2000),
        raw_record("P1", "99", 1500),
    ]);

    let envelope = normalizer::parse_envelope(Some(payload.as_slice())).unwrap();
    for item in normalizer::intents(envelope.as_ref()) {
        engine.reconcile(&item.unwrap()).await.unwrap();
    }

    assert_eq!(store.get("P1").await.unwrap(), Some(InventoryRecord::new("P1", 25, 2000)));
}

fn run<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
        .block_on(future)
}

/// Latest event time wins; ties keep whichever arrived first.
fn expected_final(intents: &[allocation_sync_core::UpdateIntent]) -> InventoryRecord {
    let mut best = &intents[0];
    for candidate in &intents[1..] {
        if candidate.event_time() > best.event_time() {
            best = candidate;
        }
    }
    InventoryRecord::from(best)
}

proptest! {
    #[test]
    fn reconciling_twice_equals_reconciling_once(first in arb_intent(), repeat in arb_intent()) {
        run(async {
            let once = InMemoryInventoryStore::new();
            let twice = InMemoryInventoryStore::new();
            let once_engine = ReconciliationEngine::new(once.clone());
            let twice_engine = ReconciliationEngine::new(twice.clone());

            for engine in [&once_engine, &twice_engine] {
                engine.reconcile(&first).await.unwrap();
            }
            once_engine.reconcile(&repeat).await.unwrap();
            twice_engine.reconcile(&repeat).await.unwrap();
            twice_engine.reconcile(&repeat).await.unwrap();

            prop_assert_eq!(once.records(), twice.records());
            Ok(())
        })?;
    }

    #[test]
    fn newer_of_two_wins_in_either_order(
        a in arb_intents_for("P1", 1),
        b in arb_intents_for("P1", 1),
    ) {
        let (a, b) = (&a[0], &b[0]);
        prop_assume!(a.event_time() != b.event_time());
        let newer = if a.event_time() > b.event_time() { a } else { b };

        run(async {
            for order in [[a, b], [b, a]] {
                let store = InMemoryInventoryStore::new();
                let engine = ReconciliationEngine::new(store.clone());
                for intent in order {
                    engine.reconcile(intent).await.unwrap();
                }
                prop_assert_eq!(store.record("P1"), Some(InventoryRecord::from(newer)));
            }
            Ok(())
        })?;
    }

    #[test]
    fn final_record_tracks_max_event_time(intents in arb_intents_for("P1", 12)) {
        run(async {
            let store = InMemoryInventoryStore::new();
            let engine = ReconciliationEngine::new(store.clone());
            let mut last_seen = i64::MIN;

            for intent in &intents {
                engine.reconcile(intent).await.unwrap();
                let ts = store.record("P1").unwrap().source_sync_timestamp;
                prop_assert!(ts >= last_seen, "source sync timestamp went backwards");
                last_seen = ts;
            }

            prop_assert_eq!(store.record("P1"), Some(expected_final(&intents)));
            Ok(())
        })?;
    }

    #[test]
    fn tie_never_changes_allocation(stored in 0_u64..100, incoming in 0_u64..100, t in 0_i64..1_000) {
        run(async {
            let store = InMemoryInventoryStore::with_records([InventoryRecord::new("P1", stored, t)]);
            let engine = ReconciliationEngine::new(store.clone());

            let outcome = engine.reconcile(&intent("P1", incoming, t)).await.unwrap();

            prop_assert!(!outcome.is_applied());
            prop_assert_eq!(store.record("P1"), Some(InventoryRecord::new("P1", stored, t)));
            Ok(())
        })?;
    }

    #[test]
    fn first_write_creates_regardless_of_time(t in i64::MIN / 2..i64::MAX / 2, allocation in any::<u64>()) {
        run(async {
            let store = InMemoryInventoryStore::new();
            let engine = ReconciliationEngine::new(store.clone());

            let outcome = engine.reconcile(&intent("P9", allocation, t)).await.unwrap();

            prop_assert_eq!(outcome, ReconcileOutcome::Inserted);
            prop_assert_eq!(store.record("P9"), Some(InventoryRecord::new("P9", allocation, t)));
            Ok(())
        })?;
    }
}
