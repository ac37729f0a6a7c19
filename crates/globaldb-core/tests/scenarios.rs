//! End-to-end replica scenarios
//!
//! Replicas here sit on separate networks unless a test wires them together,
//! and heads move between them through `Replica::learn`, so every step is
//! deterministic.

use async_trait::async_trait;
use globaldb_core::{
    MaterializedStore, MemoryStateStore, Replica, ReplicaConfig, ReplicaConfigBuilder,
    ReplicaError, ReplicaEvent,
};
use globaldb_dag::{
    fetch_delta, BroadcastError, Broadcaster, Cid, DAGStore, MemoryDAGStore, MemoryNetwork,
    PayloadStream,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn config(id: &str) -> ReplicaConfig {
    ReplicaConfigBuilder::new()
        .replica_id(id)
        .rebroadcast_interval(Duration::from_secs(3600))
        .max_fetch_attempts(3)
        .retry_delays(Duration::from_millis(1), Duration::from_millis(5))
        .build()
}

/// A replica alone on its own network, sharing `dag` with the others.
fn solo(id: &str, dag: &Arc<MemoryDAGStore>) -> (Replica, Arc<MemoryStateStore>) {
    let state = Arc::new(MemoryStateStore::new());
    let network = MemoryNetwork::new();
    let replica = Replica::open(
        config(id),
        dag.clone(),
        state.clone(),
        Arc::new(network.join(id, "globaldb")),
    );
    (replica, state)
}

/// Broadcaster whose every publish fails.
struct BrokenBroadcaster;

#[async_trait]
impl Broadcaster for BrokenBroadcaster {
    async fn broadcast(&self, _payload: Vec<u8>) -> Result<(), BroadcastError> {
        Err(BroadcastError::Send("link down".into()))
    }

    fn subscribe(&self) -> PayloadStream {
        Box::pin(futures::stream::pending())
    }
}

// ============================================================================
// Conflict resolution
// ============================================================================

#[tokio::test]
async fn test_concurrent_puts_resolve_by_larger_cid() {
    let dag = Arc::new(MemoryDAGStore::new());
    let (a, _) = solo("a", &dag);
    let (b, _) = solo("b", &dag);

    let cid_a = a.put("k", "v1").await.unwrap();
    let cid_b = b.put("k", "v2").await.unwrap();
    // Both wrote without seeing anything: same priority.
    assert_eq!(a.stats().await.max_priority, 1);
    assert_eq!(b.stats().await.max_priority, 1);

    b.learn(cid_a).await.unwrap();
    a.learn(cid_b).await.unwrap();

    let expected = if cid_a > cid_b { b"v1".to_vec() } else { b"v2".to_vec() };
    assert_eq!(a.get("k").unwrap(), Some(expected.clone()));
    assert_eq!(b.get("k").unwrap(), Some(expected));

    let heads: BTreeSet<Cid> = a.heads().await.into_iter().collect();
    assert_eq!(heads, BTreeSet::from([cid_a, cid_b]));
}

#[tokio::test]
async fn test_causally_later_write_wins() {
    let dag = Arc::new(MemoryDAGStore::new());
    let (a, _) = solo("a", &dag);
    let (b, _) = solo("b", &dag);

    for i in 0..5 {
        a.put("k", format!("a{}", i)).await.unwrap();
    }
    let head = a.heads().await[0];
    b.learn(head).await.unwrap();

    // B has observed priority 5, so its write outranks all of A's.
    let later = b.put("k", "b").await.unwrap();
    a.learn(later).await.unwrap();
    assert_eq!(a.get("k").unwrap(), Some(b"b".to_vec()));
    assert_eq!(a.heads().await, vec![later]);
}

// ============================================================================
// Tombstones
// ============================================================================

#[tokio::test]
async fn test_delete_unseen_by_partitioned_peer() {
    let dag = Arc::new(MemoryDAGStore::new());
    let (a, _) = solo("a", &dag);
    let (b, _) = solo("b", &dag);

    let added = a.put("k", "v").await.unwrap();
    b.learn(added).await.unwrap();

    let removed = a.delete("k").await.unwrap().unwrap();
    let delta = fetch_delta(dag.as_ref(), &removed).await.unwrap();
    assert_eq!(delta.removals["k"], BTreeSet::from([added]));

    assert!(!a.has("k").unwrap());
    assert_eq!(b.get("k").unwrap(), Some(b"v".to_vec()));

    b.learn(removed).await.unwrap();
    assert!(!b.has("k").unwrap());
    assert_eq!(b.get("k").unwrap(), None);
}

#[tokio::test]
async fn test_delete_keeps_concurrent_addition() {
    let dag = Arc::new(MemoryDAGStore::new());
    let (a, _) = solo("a", &dag);
    let (b, _) = solo("b", &dag);

    let first = a.put("k", "old").await.unwrap();
    b.learn(first).await.unwrap();

    // A deletes what it has seen while B concurrently writes a new value.
    let removal = a.delete("k").await.unwrap().unwrap();
    let rewrite = b.put("k", "new").await.unwrap();
    a.learn(rewrite).await.unwrap();
    b.learn(removal).await.unwrap();

    assert_eq!(a.get("k").unwrap(), Some(b"new".to_vec()));
    assert_eq!(b.get("k").unwrap(), Some(b"new".to_vec()));
}

#[tokio::test]
async fn test_delete_of_missing_key_writes_nothing() {
    let dag = Arc::new(MemoryDAGStore::new());
    let (a, _) = solo("a", &dag);

    assert_eq!(a.delete("never").await.unwrap(), None);
    assert!(a.heads().await.is_empty());
    assert!(dag.is_empty());

    a.put("k", "v").await.unwrap();
    a.delete("k").await.unwrap();
    let heads = a.heads().await;
    assert_eq!(a.delete("k").await.unwrap(), None);
    assert_eq!(a.heads().await, heads);
}

#[tokio::test]
async fn test_list_skips_tombstones() {
    let dag = Arc::new(MemoryDAGStore::new());
    let (a, _) = solo("a", &dag);

    a.put("/b", "2").await.unwrap();
    a.put("/a", "1").await.unwrap();
    a.put("/c", "3").await.unwrap();
    a.put("/other", "x").await.unwrap();
    a.delete("/c").await.unwrap();

    let listed = a.list("/").unwrap();
    let keys: Vec<&str> = listed.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["/a", "/b", "/other"]);
}

// ============================================================================
// Causal gaps
// ============================================================================

#[tokio::test]
async fn test_gap_keeps_head_pending_until_filled() {
    let dag = Arc::new(MemoryDAGStore::new());
    let (a, _) = solo("a", &dag);
    let (c, _) = solo("c", &dag);
    let mut events = c.subscribe();

    c.put("/mine", "c").await.unwrap();
    let parent = a.put("/x", "1").await.unwrap();
    let head = a.put("/y", "2").await.unwrap();
    dag.withhold(parent);

    let err = c.learn(head).await.unwrap_err();
    assert_eq!(err, ReplicaError::NotFound(parent));
    assert!(err.is_transient());

    assert_eq!(c.get("/mine").unwrap(), Some(b"c".to_vec()));
    assert_eq!(c.get("/y").unwrap(), None);
    assert!(!c.is_applied(&head).await);
    let stats = c.stats().await;
    assert_eq!(stats.pending_heads, vec![head]);
    assert_eq!(stats.sync_failures, 1);

    // The local put came first, then the failure.
    assert!(matches!(events.recv().await.unwrap(), ReplicaEvent::Put { .. }));
    assert_eq!(
        events.recv().await.unwrap(),
        ReplicaEvent::SyncFailed { head, error: err }
    );

    dag.release(&parent);
    let report = c.learn(head).await.unwrap();
    assert_eq!(report.merged.len(), 2);
    assert_eq!(c.get("/y").unwrap(), Some(b"2".to_vec()));
    let stats = c.stats().await;
    assert!(stats.pending_heads.is_empty());
    assert_eq!(stats.deltas_merged, 2);
}

#[tokio::test]
async fn test_pending_head_cleared_when_merged_as_ancestor() {
    let dag = Arc::new(MemoryDAGStore::new());
    let (a, _) = solo("a", &dag);
    let (c, _) = solo("c", &dag);

    let parent = a.put("/x", "1").await.unwrap();
    let head = a.put("/y", "2").await.unwrap();
    dag.withhold(parent);
    c.learn(head).await.unwrap_err();
    assert_eq!(c.stats().await.pending_heads, vec![head]);

    // The failed head is never announced again, only its descendant.
    let descendant = a.put("/z", "3").await.unwrap();
    dag.release(&parent);
    let report = c.learn(descendant).await.unwrap();
    assert_eq!(report.merged.len(), 3);

    assert!(c.is_applied(&head).await);
    let stats = c.stats().await;
    assert!(stats.pending_heads.is_empty());
    assert_eq!(stats.pending_evicted, 0);
}

#[tokio::test]
async fn test_pending_heads_are_bounded() {
    let dag = Arc::new(MemoryDAGStore::new());
    let network = MemoryNetwork::new();
    let c = Replica::open(
        ReplicaConfigBuilder::new()
            .replica_id("c")
            .rebroadcast_interval(Duration::from_secs(3600))
            .max_fetch_attempts(1)
            .max_pending_heads(8)
            .build(),
        dag.clone(),
        Arc::new(MemoryStateStore::new()),
        Arc::new(network.join("c", "globaldb")),
    );

    let unknown: Vec<Cid> = (0..20u32).map(|i| Cid::of(&i.to_be_bytes())).collect();
    for cid in &unknown {
        assert_eq!(c.learn(*cid).await.unwrap_err(), ReplicaError::NotFound(*cid));
    }

    let stats = c.stats().await;
    assert_eq!(stats.pending_heads, unknown[12..].to_vec());
    assert_eq!(stats.pending_evicted, 12);
    assert_eq!(stats.sync_failures, 20);

    // A repeated failure refreshes the entry instead of adding one.
    c.learn(unknown[12]).await.unwrap_err();
    let stats = c.stats().await;
    assert_eq!(stats.pending_heads.len(), 8);
    assert_eq!(stats.pending_heads.last(), Some(&unknown[12]));
    assert_eq!(stats.pending_evicted, 12);
}

// ============================================================================
// Local priorities
// ============================================================================

#[tokio::test]
async fn test_concurrent_local_puts_get_distinct_priorities() {
    let dag = Arc::new(MemoryDAGStore::new());
    let (replica, _) = solo("a", &dag);
    let replica = Arc::new(replica);

    let handles: Vec<_> = (0..1000)
        .map(|i| {
            let replica = Arc::clone(&replica);
            tokio::spawn(async move { replica.put(format!("/k/{:04}", i), "v").await })
        })
        .collect();

    let mut cids = Vec::new();
    for handle in handles {
        cids.push(handle.await.unwrap().unwrap());
    }

    let mut by_priority = Vec::new();
    for cid in &cids {
        let delta = fetch_delta(dag.as_ref(), cid).await.unwrap();
        by_priority.push((delta.priority, delta));
    }
    by_priority.sort_by_key(|(p, _)| *p);

    let priorities: Vec<u64> = by_priority.iter().map(|(p, _)| *p).collect();
    assert_eq!(priorities, (1..=1000).collect::<Vec<u64>>());

    // Each write builds on the one before it.
    for pair in by_priority.windows(2) {
        let previous = pair[0].1.cid().unwrap();
        assert!(pair[1].1.parents.contains(&previous));
    }
    assert_eq!(replica.list("/k/").unwrap().len(), 1000);
    assert_eq!(replica.heads().await.len(), 1);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_dag_write_failure_surfaces() {
    let dag = Arc::new(MemoryDAGStore::new());
    let (a, _) = solo("a", &dag);

    dag.set_fail_puts(true);
    let err = a.put("k", "v").await.unwrap_err();
    assert!(matches!(err, ReplicaError::Persistence(_)));
    assert!(a.heads().await.is_empty());
    assert_eq!(a.get("k").unwrap(), None);

    dag.set_fail_puts(false);
    a.put("k", "v").await.unwrap();
    assert_eq!(a.get("k").unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_state_write_failure_leaves_heads_alone() {
    let dag = Arc::new(MemoryDAGStore::new());
    let (a, state) = solo("a", &dag);
    let first = a.put("k", "v1").await.unwrap();

    state.set_fail_writes(true);
    assert!(matches!(
        a.put("k", "v2").await,
        Err(ReplicaError::Persistence(_))
    ));
    assert_eq!(a.heads().await, vec![first]);
    assert_eq!(a.get("k").unwrap(), Some(b"v1".to_vec()));

    state.set_fail_writes(false);
    let next = a.put("k", "v3").await.unwrap();
    assert_eq!(a.heads().await, vec![next]);
}

#[tokio::test]
async fn test_announcement_failure_is_not_a_write_failure() {
    let dag = Arc::new(MemoryDAGStore::new());
    let replica = Replica::open(
        config("a"),
        dag.clone(),
        Arc::new(MemoryStateStore::new()),
        Arc::new(BrokenBroadcaster),
    );

    let cid = replica.put("k", "v").await.unwrap();
    assert_eq!(replica.get("k").unwrap(), Some(b"v".to_vec()));
    assert!(dag.has(&cid).await.unwrap());
    assert!(replica.announce_heads().await.is_err());
    assert_eq!(replica.stats().await.announcements, 0);
}

#[tokio::test]
async fn test_malformed_messages_do_not_stop_replication() {
    let network = MemoryNetwork::new();
    let dag = Arc::new(MemoryDAGStore::new());
    let listener = Replica::open(
        config("listener"),
        dag.clone(),
        Arc::new(MemoryStateStore::new()),
        Arc::new(network.join("listener", "globaldb")),
    );
    let writer = Replica::open(
        config("writer"),
        dag.clone(),
        Arc::new(MemoryStateStore::new()),
        Arc::new(network.join("writer", "globaldb")),
    );
    let attacker = network.join("attacker", "globaldb");
    let mut events = listener.subscribe();

    // Let the receive loops subscribe.
    tokio::time::sleep(Duration::from_millis(50)).await;
    attacker.broadcast(b"\xffnot an announcement".to_vec()).await.unwrap();
    attacker.broadcast(br#"{"heads":[]}"#.to_vec()).await.unwrap();
    writer.put("k", "v").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while listener.get("k").unwrap().is_none() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(listener.get("k").unwrap(), Some(b"v".to_vec()));
    assert_eq!(listener.stats().await.malformed_messages, 2);
    assert!(matches!(
        events.recv().await.unwrap(),
        ReplicaEvent::MalformedMessage { .. }
    ));

    listener.close().await;
    writer.close().await;
}

// ============================================================================
// Lifecycle and recovery
// ============================================================================

#[tokio::test]
async fn test_closed_replica_rejects_writes() {
    let dag = Arc::new(MemoryDAGStore::new());
    let (a, _) = solo("a", &dag);
    a.put("k", "v").await.unwrap();

    a.close().await;
    assert!(a.is_closed());
    assert_eq!(a.put("k", "w").await.unwrap_err(), ReplicaError::Closed);
    assert_eq!(a.learn(Cid::of(b"x")).await.unwrap_err(), ReplicaError::Closed);
    // Reads keep working.
    assert_eq!(a.get("k").unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_close_aborts_in_flight_fetches() {
    let dag = Arc::new(MemoryDAGStore::new());
    let replica = Arc::new(Replica::open(
        ReplicaConfigBuilder::new()
            .replica_id("a")
            .max_fetch_attempts(10_000)
            .retry_delays(Duration::from_millis(20), Duration::from_millis(20))
            .build(),
        dag,
        Arc::new(MemoryStateStore::new()),
        Arc::new(BrokenBroadcaster),
    ));

    let learner = {
        let replica = Arc::clone(&replica);
        tokio::spawn(async move { replica.learn(Cid::of(b"missing")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    replica.close().await;

    let result = tokio::time::timeout(Duration::from_secs(2), learner)
        .await
        .expect("learn did not stop")
        .unwrap();
    assert_eq!(result.unwrap_err(), ReplicaError::Cancelled);
    assert_eq!(replica.stats().await.sync_failures, 0);
}

#[tokio::test]
async fn test_recover_rebuilds_state() {
    let dag = Arc::new(MemoryDAGStore::new());
    let (a, state) = solo("a", &dag);
    a.put("/a", "1").await.unwrap();
    a.put("/b", "2").await.unwrap();
    a.put("/a", "3").await.unwrap();
    a.delete("/b").await.unwrap();
    let before = state.snapshot();

    state.clear().unwrap();
    assert_eq!(a.get("/a").unwrap(), None);

    a.recover().await.unwrap();
    assert_eq!(state.snapshot(), before);
    assert_eq!(a.get("/a").unwrap(), Some(b"3".to_vec()));
    assert!(!a.has("/b").unwrap());
    assert_eq!(a.stats().await.applied, 4);
}

#[tokio::test]
async fn test_events_report_local_changes() {
    let dag = Arc::new(MemoryDAGStore::new());
    let (a, _) = solo("a", &dag);
    let mut events = a.subscribe();

    a.put("k", "v").await.unwrap();
    a.delete("k").await.unwrap();

    assert_eq!(
        events.recv().await.unwrap(),
        ReplicaEvent::Put {
            key: "k".into(),
            value: b"v".to_vec()
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        ReplicaEvent::Delete { key: "k".into() }
    );
}
