use common::{Lease, Object};
use rkp::api::{EventSource, MemoryStore};
use rkp::leader::{LeaderConfig, LeaderElector, LeaderGate};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

const LEASE: &str = "rkp-leader";

struct Node {
    identity: String,
    gate: LeaderGate,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

fn config(identity: &str) -> LeaderConfig {
    LeaderConfig {
        lease_name: LEASE.to_string(),
        identity: identity.to_string(),
        lease_duration: Duration::from_millis(600),
        renew_deadline: Duration::from_millis(400),
        retry_period: Duration::from_millis(100),
    }
}

fn spawn_node(source: &EventSource, identity: &str) -> Node {
    let elector = LeaderElector::new(config(identity), source.clone()).unwrap();
    let gate = elector.gate();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(elector.run(shutdown.clone()));
    Node {
        identity: identity.to_string(),
        gate,
        shutdown,
        handle,
    }
}

fn leaders(nodes: &[Node]) -> Vec<usize> {
    nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.gate.is_leader())
        .map(|(i, _)| i)
        .collect()
}

/// Samples every few milliseconds until a leader outside `excluded` shows
/// up, failing if two nodes ever claim leadership at once.
async fn wait_for_leader(nodes: &[Node], excluded: &[usize], limit: Duration) -> usize {
    let deadline = Instant::now() + limit;
    loop {
        let current = leaders(nodes);
        assert!(current.len() <= 1, "several leaders at once: {current:?}");
        if let Some(&leader) = current.first()
            && !excluded.contains(&leader)
        {
            return leader;
        }
        assert!(Instant::now() < deadline, "no new leader within {limit:?}");
        sleep(Duration::from_millis(5)).await;
    }
}

async fn sample_for(nodes: &[Node], period: Duration) {
    let deadline = Instant::now() + period;
    while Instant::now() < deadline {
        let current = leaders(nodes);
        assert!(current.len() <= 1, "several leaders at once: {current:?}");
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
#[serial]
async fn test_single_leader_through_release_and_crash() {
    let source = EventSource::new(Arc::new(MemoryStore::new()));
    let nodes: Vec<_> = ["node-a", "node-b", "node-c"]
        .iter()
        .map(|id| spawn_node(&source, id))
        .collect();

    let first = wait_for_leader(&nodes, &[], Duration::from_secs(2)).await;
    sample_for(&nodes, Duration::from_millis(500)).await;
    assert_eq!(leaders(&nodes), vec![first]);
    let first_term = nodes[first].gate.current_term().unwrap();

    // graceful shutdown releases the lease right away
    nodes[first].shutdown.cancel();
    let released_at = Instant::now();
    let second = wait_for_leader(&nodes, &[first], Duration::from_secs(2)).await;
    assert!(!first_term.is_active());
    assert!(released_at.elapsed() < Duration::from_millis(600));

    let lease: Lease = source.get(LEASE).await.unwrap().unwrap();
    assert_eq!(lease.holder(), Some(nodes[second].identity.as_str()));

    // a crashed leader keeps the lease until it expires
    nodes[second].handle.abort();
    let crashed_at = Instant::now();
    let third = wait_for_leader(&nodes, &[first, second], Duration::from_secs(3)).await;
    assert!(crashed_at.elapsed() >= Duration::from_millis(300));

    let lease: Lease = source.get(LEASE).await.unwrap().unwrap();
    assert_eq!(lease.holder(), Some(nodes[third].identity.as_str()));
    assert!(lease.spec.lease_transitions >= 1);

    for node in &nodes {
        node.shutdown.cancel();
    }
    for node in nodes {
        let _ = node.handle.await;
    }
    assert!(source.get::<Lease>(LEASE).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn test_leadership_lost_when_lease_taken() {
    let source = EventSource::new(Arc::new(MemoryStore::new()));
    let node = spawn_node(&source, "node-a");
    let mut gate = node.gate.clone();
    let term = timeout(Duration::from_secs(2), gate.wait_for_term())
        .await
        .unwrap()
        .unwrap();

    let mut lease: Lease = source.get(LEASE).await.unwrap().unwrap();
    lease.spec.holder_identity = Some("intruder".to_string());
    lease.spec.renew_time = Some(chrono::Utc::now());
    source.update(&lease).await.unwrap();

    timeout(Duration::from_secs(1), term.lost())
        .await
        .expect("term should end once the lease changed hands");
    assert!(!node.gate.is_leader());

    node.shutdown.cancel();
    node.handle.await.unwrap();
    // not ours anymore, so it must survive shutdown
    let lease: Lease = source.get(LEASE).await.unwrap().unwrap();
    assert_eq!(lease.holder(), Some("intruder"));
    assert_eq!(lease.name(), LEASE);
}

#[tokio::test]
#[serial]
async fn test_gate_reports_no_term_after_elector_stops() {
    let source = EventSource::new(Arc::new(MemoryStore::new()));
    let node = spawn_node(&source, "node-a");
    let mut gate = node.gate.clone();
    assert!(gate.wait_for_term().await.is_some());

    node.shutdown.cancel();
    node.handle.await.unwrap();
    assert!(gate.wait_for_term().await.is_none());
}
