use nexa_orchestrator::{
    cluster::{
        ClusterNode, ClusterOrchestrator, LocalNetwork, ManualClock, NodeStatus, SessionConfig, SessionPatch,
        SessionStatus,
    },
    config::ClusterConfig,
    error::OrchestratorError,
    store::{InMemorySessionStore, LocalSessionStore},
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const START_MILLIS: u64 = 1_700_000_000_000;

/// Long timer periods so the background tasks stay out of the way; tests
/// drive heartbeat, gossip and sweep rounds explicitly.
fn node_config(id: &str, port: u16, seeds: &[String], replication_factor: usize) -> ClusterConfig {
    let mut config = ClusterConfig::for_node(id, "127.0.0.1", port);
    config.seeds = seeds.to_vec();
    config.replication_factor = replication_factor;
    config.gossip_interval_ms = 10_000;
    config.heartbeat_timeout_ms = 60_000;
    config.sync_interval_ms = 60_000;
    config.request_timeout_ms = 200;
    config.max_retries = 1;
    config.retry_backoff_ms = 1;
    config
}

struct TestCluster {
    network: Arc<LocalNetwork>,
    clock: Arc<ManualClock>,
    nodes: Vec<ClusterOrchestrator>,
}

impl TestCluster {
    async fn start(ids: &[&str], replication_factor: usize) -> Result<Self, OrchestratorError> {
        let stores = ids
            .iter()
            .map(|_| Arc::new(InMemorySessionStore::new(10_000)) as Arc<dyn LocalSessionStore>)
            .collect();
        Self::with_stores(ids, replication_factor, stores).await
    }

    async fn with_stores(
        ids: &[&str],
        replication_factor: usize,
        stores: Vec<Arc<dyn LocalSessionStore>>,
    ) -> Result<Self, OrchestratorError> {
        let network = LocalNetwork::new();
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let mut nodes: Vec<ClusterOrchestrator> = Vec::new();

        for (i, (id, store)) in ids.iter().zip(stores).enumerate() {
            let seeds: Vec<String> = nodes.first().map(|n| vec![n.address().to_string()]).unwrap_or_default();
            let config = node_config(id, 7000 + i as u16, &seeds, replication_factor);
            let node = ClusterOrchestrator::new(config, store, network.clone(), clock.clone())?;
            node.start().await?;
            nodes.push(node);
        }

        let cluster = Self { network, clock, nodes };
        cluster.converge().await;
        Ok(cluster)
    }

    async fn converge(&self) {
        for _ in 0..2 {
            for node in &self.nodes {
                node.gossip_round().await;
            }
        }
        for node in &self.nodes {
            node.heartbeat_round().await;
            node.cleanup_dead_nodes().await;
        }
    }

    fn node(&self, id: &str) -> &ClusterOrchestrator {
        self.nodes
            .iter()
            .find(|n| n.node_id() == id)
            .unwrap_or_else(|| panic!("no node {}", id))
    }

    /// First session ids, in order, owned by `owner` on `observer`'s ring.
    fn ids_owned_by(&self, observer: &str, owner: &str, count: usize) -> Vec<String> {
        let ring = self.node(observer).ring();
        (0..)
            .map(|i| format!("{}-session-{}", owner, i))
            .filter(|id| ring.get_node(id).map(|o| o == owner).unwrap_or(false))
            .take(count)
            .collect()
    }

    async fn shutdown(&self) {
        for node in &self.nodes {
            node.halt().await;
        }
    }
}

fn session_with_id(id: &str) -> SessionConfig {
    let mut config = SessionConfig::new("agent", format!("name-{}", id));
    config.id = Some(id.to_string());
    config
}

#[tokio::test]
async fn test_nodes_discover_each_other_through_a_seed() -> Result<(), OrchestratorError> {
    let cluster = TestCluster::start(&["node-a", "node-b", "node-c"], 2).await?;

    for node in &cluster.nodes {
        let metrics = node.get_cluster_metrics();
        assert_eq!(metrics.total_nodes, 3, "{} sees everyone", node.node_id());
        assert_eq!(metrics.healthy_nodes, 3);
        assert_eq!(node.ring().len(), 3);
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_two_nodes_share_ownership_of_ten_sessions() -> Result<(), OrchestratorError> {
    let cluster = TestCluster::start(&["node-a", "node-b"], 2).await?;
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");

    let mut owners = std::collections::HashSet::new();
    for i in 0..10 {
        let session = a.create_session(SessionConfig::new("agent", format!("s{}", i))).await?;
        owners.insert(a.ring().get_node(&session.id)?.to_string());
    }
    assert_eq!(owners.len(), 2, "no single node owns all ten");

    // Replication factor two on two nodes: both hold every session.
    assert_eq!(a.get_local_metrics().stored_sessions, 10);
    assert_eq!(b.get_local_metrics().stored_sessions, 10);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_node_death_keeps_every_session() -> Result<(), OrchestratorError> {
    let cluster = TestCluster::start(&["node-a", "node-b"], 2).await?;
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");

    let mut ids = Vec::new();
    for i in 0..10 {
        let creator = if i % 2 == 0 { a } else { b };
        ids.push(creator.create_session(SessionConfig::new("agent", format!("s{}", i))).await?.id);
    }
    b.heartbeat_round().await;
    let before = a.get_cluster_metrics();
    assert_eq!(before.healthy_nodes, 2);
    assert_eq!(before.total_sessions, 10);

    b.halt().await;
    a.remove_node("node-b").await?;
    a.cleanup_dead_nodes().await;

    let after = a.get_cluster_metrics();
    assert_eq!(after.healthy_nodes, before.healthy_nodes - 1);
    assert_eq!(after.total_sessions, before.total_sessions);
    for id in &ids {
        assert!(a.get_session(id).await?.is_some(), "session {} survived", id);
    }
    assert_eq!(a.membership().node("node-b").map(|n| n.status), Some(NodeStatus::Removed));

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_round_robin_creation_is_fast_and_counted() -> Result<(), OrchestratorError> {
    let cluster = TestCluster::start(&["node-a", "node-b"], 2).await?;

    let started = Instant::now();
    for i in 0..500 {
        let node = &cluster.nodes[i % 2];
        node.create_session(SessionConfig::new("agent", format!("bulk-{}", i))).await?;
    }
    let average = started.elapsed() / 500;
    assert!(average < Duration::from_millis(5), "average create took {:?}", average);

    for node in &cluster.nodes {
        node.heartbeat_round().await;
    }
    assert_eq!(cluster.nodes[0].get_cluster_metrics().total_sessions, 500);
    assert_eq!(cluster.nodes[1].get_cluster_metrics().total_sessions, 500);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_delete_is_idempotent_across_nodes() -> Result<(), OrchestratorError> {
    let cluster = TestCluster::start(&["node-a", "node-b"], 2).await?;
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");

    let session = a.create_session(SessionConfig::new("agent", "short-lived")).await?;
    assert!(b.delete_session(&session.id).await?);
    assert!(!a.delete_session(&session.id).await?);

    assert_eq!(a.get_session(&session.id).await?, None);
    assert_eq!(b.get_session(&session.id).await?, None);
    assert_eq!(a.get_local_metrics().stored_sessions, 0);
    assert_eq!(b.get_local_metrics().stored_sessions, 0);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_session_is_not_found() -> Result<(), OrchestratorError> {
    let cluster = TestCluster::start(&["node-a", "node-b"], 2).await?;
    let a = cluster.node("node-a");

    assert_eq!(a.get_session("missing").await?, None);
    assert_eq!(a.update_session("missing", SessionPatch::default()).await?, None);
    assert!(!a.delete_session("missing").await?);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_updates_are_applied_at_the_owner() -> Result<(), OrchestratorError> {
    let cluster = TestCluster::start(&["node-a", "node-b"], 2).await?;
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");

    let id = cluster.ids_owned_by("node-a", "node-a", 1).remove(0);
    let created = b.create_session(session_with_id(&id)).await?;
    assert_eq!(created.id, id);
    assert_eq!(a.session_placement(&id).map(|p| p.owner), Some("node-a".to_string()));

    let patch = SessionPatch {
        name: Some("renamed".into()),
        status: Some(SessionStatus::Idle),
        ..SessionPatch::default()
    };
    let updated = b.update_session(&id, patch).await?.expect("session exists");
    assert_eq!(updated.name, "renamed");
    assert!(updated.updated_at >= created.updated_at);

    let read_back = b.get_session(&id).await?.expect("session exists");
    assert_eq!(read_back.status, SessionStatus::Idle);

    cluster.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_heartbeat_revives_suspect_node() -> Result<(), OrchestratorError> {
    let cluster = TestCluster::start(&["node-a", "node-b"], 2).await?;
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");

    // Past gossip_interval x 3, short of the heartbeat timeout.
    cluster.clock.advance(Duration::from_secs(31));
    let report = a.cleanup_dead_nodes().await;
    assert_eq!(report.suspected, vec!["node-b".to_string()]);
    assert_eq!(a.membership().node("node-b").map(|n| n.status), Some(NodeStatus::Suspect));
    assert!(!a.ring().contains("node-b"), "suspect nodes leave the ring");

    b.heartbeat_round().await;
    assert_eq!(a.membership().node("node-b").map(|n| n.status), Some(NodeStatus::Healthy));
    assert!(a.ring().contains("node-b"));

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_silent_node_is_declared_dead_then_removed() -> Result<(), OrchestratorError> {
    let cluster = TestCluster::start(&["node-a", "node-b"], 2).await?;
    let a = cluster.node("node-a");
    cluster.node("node-b").halt().await;

    cluster.clock.advance(Duration::from_secs(61));
    let first = a.cleanup_dead_nodes().await;
    assert_eq!(first.dead, vec!["node-b".to_string()]);
    let second = a.cleanup_dead_nodes().await;
    assert_eq!(second.removed, vec!["node-b".to_string()]);
    assert_eq!(a.get_cluster_metrics().total_nodes, 1);

    // Second-hand gossip about the removed node does not bring it back.
    let mut rumour = ClusterNode::new("node-b", "127.0.0.1", 7001);
    rumour.last_heartbeat = START_MILLIS + 120_000;
    a.membership().merge(vec![rumour], Some("node-c"));
    assert_eq!(a.membership().node("node-b").map(|n| n.status), Some(NodeStatus::Removed));

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_owner_fails_writes_but_not_reads() -> Result<(), OrchestratorError> {
    let cluster = TestCluster::start(&["node-a", "node-b"], 2).await?;
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");

    let ids = cluster.ids_owned_by("node-a", "node-b", 2);
    a.create_session(session_with_id(&ids[0])).await?;

    cluster.network.set_down(b.address(), true);
    let err = a.create_session(session_with_id(&ids[1])).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::OwnerUnreachable(_)), "got {:?}", err);

    // The read falls through to the replica on node-a.
    assert!(a.get_session(&ids[0]).await?.is_some());

    cluster.network.heal();
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_single_node_runs_under_replicated() -> Result<(), OrchestratorError> {
    let cluster = TestCluster::start(&["node-a"], 2).await?;
    let a = cluster.node("node-a");

    let session = a.create_session(SessionConfig::new("agent", "alone")).await?;
    let placement = a.session_placement(&session.id).expect("placement recorded");
    assert!(placement.under_replicated);
    assert!(placement.replicas.is_empty());
    assert_eq!(a.get_cluster_metrics().under_replicated_sessions, 1);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_local_only_mode_without_healthy_nodes() -> Result<(), OrchestratorError> {
    let network = LocalNetwork::new();
    let config = node_config("node-a", 7000, &[], 2);
    // Never started: the node is not healthy in its own view and the ring is empty.
    let node = ClusterOrchestrator::new(
        config,
        Arc::new(InMemorySessionStore::default()),
        network,
        Arc::new(ManualClock::new(START_MILLIS)),
    )?;
    assert!(node.ring().is_empty());

    let session = node.create_session(SessionConfig::new("agent", "offline")).await?;
    assert!(node.session_placement(&session.id).expect("placement").under_replicated);
    assert_eq!(node.get_session(&session.id).await?.map(|s| s.id), Some(session.id.clone()));
    assert!(node.delete_session(&session.id).await?);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_hands_sessions_to_the_next_owner() -> Result<(), OrchestratorError> {
    let cluster = TestCluster::start(&["node-a", "node-b", "node-c"], 1).await?;
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");
    let c = cluster.node("node-c");

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(a.create_session(SessionConfig::new("agent", format!("h{}", i))).await?.id);
    }
    assert!(c.get_local_metrics().owned_sessions > 0);

    c.shutdown().await?;
    assert!(!c.is_running());
    for survivor in [a, b] {
        survivor.remove_node("node-c").await?;
        survivor.cleanup_dead_nodes().await;
    }

    for id in &ids {
        assert!(a.get_session(id).await?.is_some(), "session {} was handed off", id);
    }
    b.heartbeat_round().await;
    assert_eq!(a.get_cluster_metrics().total_sessions, 20);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_lost_content_is_served_degraded() -> Result<(), OrchestratorError> {
    // node-b can hold a single replica; the others keep metadata only.
    let stores: Vec<Arc<dyn LocalSessionStore>> = vec![
        Arc::new(InMemorySessionStore::new(100)),
        Arc::new(InMemorySessionStore::new(1)),
    ];
    let cluster = TestCluster::with_stores(&["node-a", "node-b"], 2, stores).await?;
    let a = cluster.node("node-a");
    let b = cluster.node("node-b");

    let ids = cluster.ids_owned_by("node-a", "node-a", 3);
    for id in &ids {
        a.create_session(session_with_id(id)).await?;
    }
    assert_eq!(b.get_local_metrics().stored_sessions, 1);
    assert_eq!(b.get_local_metrics().tracked_placements, 3);

    a.halt().await;
    b.remove_node("node-a").await?;

    let mut degraded = 0;
    for id in &ids {
        let session = b.get_session(id).await?.expect("at least metadata survives");
        if session.status == SessionStatus::Degraded {
            degraded += 1;
            assert_eq!(session.config, serde_json::Value::Null);
        }
    }
    assert_eq!(degraded, 2);
    assert_eq!(b.get_cluster_metrics().degraded_sessions, 2);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_new_owner_reclaims_stale_copies() -> Result<(), OrchestratorError> {
    let network = LocalNetwork::new();
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let mut nodes = Vec::new();
    for (i, id) in ["node-a", "node-b", "node-c"].iter().enumerate() {
        let seeds: Vec<String> = nodes
            .first()
            .map(|n: &ClusterOrchestrator| vec![n.address().to_string()])
            .unwrap_or_default();
        let mut config = node_config(id, 7000 + i as u16, &seeds, 1);
        config.stale_grace_ms = 0;
        let node = ClusterOrchestrator::new(
            config,
            Arc::new(InMemorySessionStore::default()),
            network.clone(),
            clock.clone(),
        )?;
        // node-c joins once the sessions exist.
        if i < 2 {
            node.start().await?;
        }
        nodes.push(node);
    }
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    a.gossip_round().await;
    b.gossip_round().await;

    let mut ids = Vec::new();
    for i in 0..30 {
        ids.push(a.create_session(SessionConfig::new("agent", format!("m{}", i))).await?.id);
    }

    c.start().await?;
    for node in &nodes {
        node.gossip_round().await;
        node.cleanup_dead_nodes().await;
    }

    let moved: Vec<&String> = ids.iter().filter(|id| c.ring().get_node(id).ok() == Some("node-c")).collect();
    assert!(!moved.is_empty());
    let stale: usize = [a, b].iter().map(|n| n.rebalancer().stale_count()).sum();
    assert_eq!(stale, moved.len());

    let mut evicted = 0;
    for node in [a, b] {
        evicted += node.sync_round().await.stale_evicted;
    }
    assert_eq!(evicted, moved.len());
    assert_eq!(c.get_local_metrics().stored_sessions, moved.len());

    for id in &ids {
        assert!(b.get_session(id).await?.is_some(), "session {} readable after move", id);
    }

    for node in &nodes {
        node.halt().await;
    }
    Ok(())
}

/// node-a and node-b hold `sessions` sessions before node-c joins.
async fn cluster_with_late_joiner(
    replication_factor: usize,
    sessions: usize,
) -> Result<(Vec<ClusterOrchestrator>, Vec<Arc<InMemorySessionStore>>, Vec<String>), OrchestratorError> {
    let network = LocalNetwork::new();
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let mut nodes: Vec<ClusterOrchestrator> = Vec::new();
    let mut stores = Vec::new();
    for (i, id) in ["node-a", "node-b", "node-c"].iter().enumerate() {
        let seeds: Vec<String> = nodes.first().map(|n| vec![n.address().to_string()]).unwrap_or_default();
        let mut config = node_config(id, 7000 + i as u16, &seeds, replication_factor);
        config.stale_grace_ms = 0;
        let store = Arc::new(InMemorySessionStore::default());
        let node = ClusterOrchestrator::new(config, store.clone(), network.clone(), clock.clone())?;
        if i < 2 {
            node.start().await?;
        }
        nodes.push(node);
        stores.push(store);
    }
    nodes[0].gossip_round().await;
    nodes[1].gossip_round().await;

    let mut ids = Vec::new();
    for i in 0..sessions {
        ids.push(nodes[0].create_session(SessionConfig::new("agent", format!("j{}", i))).await?.id);
    }

    nodes[2].start().await?;
    for _ in 0..2 {
        for node in &nodes {
            node.gossip_round().await;
        }
    }
    for node in &nodes {
        node.cleanup_dead_nodes().await;
    }
    for node in &nodes {
        node.heartbeat_round().await;
    }
    Ok((nodes, stores, ids))
}

#[tokio::test]
async fn test_joining_owner_receives_sessions_it_never_held() -> Result<(), OrchestratorError> {
    let (nodes, stores, ids) = cluster_with_late_joiner(2, 40).await?;
    let (a, c) = (&nodes[0], &nodes[2]);
    assert_eq!(c.ring().len(), 3);

    let moved = ids.iter().filter(|id| c.ring().get_node(id).ok() == Some("node-c")).count();
    assert!(moved > 0);
    for id in &ids {
        let owner = c.ring().get_node(id)?.to_string();
        let index = nodes.iter().position(|n| n.node_id() == owner).unwrap();
        assert!(stores[index].get_session(id)?.is_some(), "{} holds {}", owner, id);
    }

    assert_eq!(c.get_local_metrics().owned_sessions, moved);
    assert_eq!(a.get_cluster_metrics().total_sessions, 40);

    for node in &nodes {
        node.halt().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_delete_after_ownership_moves_stays_deleted() -> Result<(), OrchestratorError> {
    let (nodes, stores, ids) = cluster_with_late_joiner(2, 40).await?;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    let victim = ids
        .iter()
        .find(|id| c.ring().get_node(id).ok() == Some("node-c"))
        .unwrap()
        .clone();
    assert!(c.delete_session(&victim).await?, "first delete finds the session");
    assert!(!c.delete_session(&victim).await?);

    for node in [a, b, c] {
        node.sync_round().await;
    }

    assert_eq!(a.get_session(&victim).await?, None);
    assert_eq!(c.get_session(&victim).await?, None);
    for store in &stores {
        assert_eq!(store.get_session(&victim)?, None);
    }
    for node in &nodes {
        assert!(!node.rebalancer().is_stale(&victim));
    }

    for node in &nodes {
        node.halt().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_read_survives_a_failed_repair() -> Result<(), OrchestratorError> {
    let a_store = Arc::new(InMemorySessionStore::new(1));
    let stores: Vec<Arc<dyn LocalSessionStore>> = vec![a_store.clone(), Arc::new(InMemorySessionStore::default())];
    let cluster = TestCluster::with_stores(&["node-a", "node-b"], 2, stores).await?;
    let a = cluster.node("node-a");

    let id = cluster.ids_owned_by("node-a", "node-a", 1).remove(0);
    a.create_session(session_with_id(&id)).await?;

    // The owner loses its copy and fills up with something else.
    assert!(a_store.delete_session(&id)?);
    a_store.create_session(SessionConfig::new("agent", "filler"))?;

    let session = a.get_session(&id).await?;
    assert_eq!(session.map(|s| s.id), Some(id.clone()));

    let patch = SessionPatch {
        name: Some("renamed".into()),
        ..SessionPatch::default()
    };
    assert_eq!(
        a.update_session(&id, patch).await,
        Err(OrchestratorError::CapacityExceeded(1))
    );

    cluster.shutdown().await;
    Ok(())
}
