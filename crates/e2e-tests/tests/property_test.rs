//! Ordering and consistency properties.

use std::collections::BTreeMap;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use e2e_tests::{wait_for, BulkGate, ScriptedIndexer, TestHarness};
use state_indexer::{Indexer, IndexerRegistry, MemoryIndexer, VersionStore};
use state_types::{KeyMatcher, StateChangeEvent, StateRecord, Subscription};

/// Versions 1..=n in a fixed scrambled order.
fn scrambled(n: u64) -> Vec<u64> {
    let mut versions: Vec<u64> = (1..=n).collect();
    versions.sort_by_key(|v| (v * 7919) % 31);
    versions
}

#[tokio::test]
async fn test_observed_version_is_highest_seen() {
    let harness = TestHarness::new();
    VersionStore::set(harness.storage.as_ref(), "idx", 1).unwrap();
    let idx = Arc::new(ScriptedIndexer::new(
        "idx",
        1,
        vec![Subscription::all("device")],
    ));
    harness.registry.register(idx.clone()).unwrap();

    let mut highest = BTreeMap::new();
    for key in ["d1", "d2", "d3"] {
        for version in scrambled(20) {
            let event: StateChangeEvent =
                StateRecord::new("device", key, version.to_string().into_bytes(), version).into();
            harness.dispatcher.dispatch(&event).await;
            let entry = highest.entry(key).or_insert(0);
            *entry = (*entry).max(version);
        }
    }

    for (key, version) in highest {
        assert_eq!(
            idx.projection().observed_version("device", key),
            Some(version)
        );
        assert_eq!(
            idx.projection().get("device", key),
            Some(version.to_string().into_bytes())
        );
    }
}

#[test]
fn test_matcher_is_deterministic() {
    let build = |order: &[usize]| {
        let indexers: Vec<Arc<dyn Indexer>> = vec![
            Arc::new(MemoryIndexer::new("a", 1, vec![Subscription::all("device")])),
            Arc::new(MemoryIndexer::new(
                "b",
                1,
                vec![Subscription::with_matcher(
                    "device",
                    KeyMatcher::prefix("lte-"),
                )],
            )),
            Arc::new(MemoryIndexer::new(
                "c",
                1,
                vec![
                    Subscription::with_matcher("device", KeyMatcher::exact("lte-7")),
                    Subscription::all("gateway"),
                ],
            )),
        ];
        let registry = IndexerRegistry::new();
        for &i in order {
            registry.register(indexers[i].clone()).unwrap();
        }
        registry.matcher()
    };

    let first = build(&[0, 1, 2]);
    let second = build(&[2, 0, 1]);

    let probes = [
        ("device", "lte-7"),
        ("device", "lte-1"),
        ("device", "wifi-1"),
        ("gateway", "g1"),
        ("subscriber", "imsi"),
    ];
    for (state_type, key) in probes {
        let a: Vec<_> = first.match_state(state_type, key).into_iter().collect();
        let b: Vec<_> = second.match_state(state_type, key).into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a, first.match_state(state_type, key).into_iter().collect::<Vec<_>>());
    }

    let all: Vec<_> = first
        .match_state("device", "lte-7")
        .into_iter()
        .collect();
    assert_eq!(all, vec!["a", "b", "c"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_update_lost_across_reindex() {
    let harness = TestHarness::new();
    for i in 0..50 {
        harness
            .store
            .put("device", format!("d{:02}", i), b"initial".to_vec());
    }
    VersionStore::set(harness.storage.as_ref(), "idx", 1).unwrap();

    let gate = Arc::new(BulkGate::default());
    let idx = Arc::new(
        ScriptedIndexer::new("idx", 2, vec![Subscription::all("device")])
            .with_gate(gate.clone()),
    );
    harness.registry.register(idx.clone()).unwrap();

    let cancel = CancellationToken::new();
    let dispatcher = harness.spawn_dispatcher(cancel.clone()).await;
    let coordinator = harness.coordinator.clone();
    let flow = tokio::spawn(async move {
        coordinator
            .reindex("idx", &CancellationToken::new())
            .await
    });

    gate.entered().await;
    for i in (0..50).step_by(3) {
        harness
            .store
            .put("device", format!("d{:02}", i), b"updated".to_vec());
    }
    harness.store.delete("device", "d01");
    harness.store.put("device", "d99", b"created".to_vec());
    wait_for("events parked", || harness.dispatcher.stats().queued == 19).await;

    gate.open();
    flow.await.unwrap().unwrap().expect("a job should run");

    // Live traffic after the lease is released goes straight through.
    harness.store.put("device", "d02", b"after".to_vec());
    wait_for("live delivery", || harness.dispatcher.stats().delivered == 1).await;

    for i in (0..50).chain([99]) {
        let key = format!("d{:02}", i);
        let expected = harness.store.get("device", &key);
        assert_eq!(
            idx.projection().get("device", &key),
            expected.as_ref().map(|r| r.value.clone()),
            "key {}",
            key
        );
        if let Some(record) = expected {
            assert_eq!(
                idx.projection().observed_version("device", &key),
                Some(record.version),
                "key {}",
                key
            );
        }
    }
    assert_eq!(idx.projection().get("device", "d01"), None);
    assert_eq!(harness.checkpoint("idx"), Some(2));

    cancel.cancel();
    dispatcher.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reindex_of_one_indexer_does_not_block_another() {
    let harness = TestHarness::new();
    harness.store.put("device", "d1", b"v".to_vec());
    VersionStore::set(harness.storage.as_ref(), "busy", 1).unwrap();
    VersionStore::set(harness.storage.as_ref(), "idle", 1).unwrap();

    let gate = Arc::new(BulkGate::default());
    let busy = Arc::new(
        ScriptedIndexer::new("busy", 2, vec![Subscription::all("device")])
            .with_gate(gate.clone()),
    );
    let idle = Arc::new(ScriptedIndexer::new(
        "idle",
        1,
        vec![Subscription::all("device")],
    ));
    harness.registry.register(busy.clone()).unwrap();
    harness.registry.register(idle.clone()).unwrap();

    let cancel = CancellationToken::new();
    let dispatcher = harness.spawn_dispatcher(cancel.clone()).await;
    let coordinator = harness.coordinator.clone();
    let flow = tokio::spawn(async move {
        coordinator
            .reindex("busy", &CancellationToken::new())
            .await
    });

    gate.entered().await;
    harness.store.put("device", "d1", b"live".to_vec());
    wait_for("fan-out", || {
        let stats = harness.dispatcher.stats();
        stats.delivered == 1 && stats.queued == 1
    })
    .await;
    assert_eq!(idle.index_calls(), vec![vec![("d1".to_string(), 2)]]);

    gate.open();
    flow.await.unwrap().unwrap();
    assert_eq!(busy.projection().get("device", "d1"), Some(b"live".to_vec()));

    cancel.cancel();
    dispatcher.await.unwrap();
}
