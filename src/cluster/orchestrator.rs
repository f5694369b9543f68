//! Cluster Orchestrator
//!
//! The public face of one node:
//! - Session CRUD routed to each session's owner
//! - Background heartbeat, gossip, sweep and anti-entropy tasks
//! - Dispatch of incoming messages to membership and replication
//! - Cluster and node metrics, join and shutdown

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::clock::{Clock, SystemClock};
use crate::cluster::membership::{MembershipTable, SweepReport};
use crate::cluster::metrics::{ClusterMetrics, LocalMetrics};
use crate::cluster::rebalance::{FailoverRebalancer, RebalanceReport};
use crate::cluster::replication::{ReplicationCoordinator, SessionDirectory, WriteOp};
use crate::cluster::ring::HashRing;
use crate::cluster::transport::{Ack, Envelope, MessageHandler, MessagePayload, OpReply, RetryPolicy, SessionOp, Transport};
use crate::cluster::types::{ClusterNode, Session, SessionConfig, SessionPatch, SessionPlacement};
use crate::config::ClusterConfig;
use crate::error::{OrchestratorError, Result};
use crate::store::{InMemorySessionStore, LocalSessionStore};

/// What one anti-entropy round did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub replicas_pushed: usize,
    pub stale_evicted: usize,
}

#[derive(Debug, Clone)]
pub struct ClusterOrchestrator {
    config: Arc<ClusterConfig>,
    store: Arc<dyn LocalSessionStore>,
    transport: Arc<dyn Transport>,
    membership: Arc<MembershipTable>,
    replication: Arc<ReplicationCoordinator>,
    rebalancer: Arc<FailoverRebalancer>,
    forward_retry: RetryPolicy,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ClusterOrchestrator {
    pub fn new(
        config: ClusterConfig,
        store: Arc<dyn LocalSessionStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let membership = Arc::new(MembershipTable::new(&config, clock, transport.clone()));
        let forward_retry = membership.settings().retry;
        let replication = Arc::new(ReplicationCoordinator::new(
            config.replication_factor,
            membership.clone(),
            store.clone(),
            transport.clone(),
            Arc::new(SessionDirectory::new()),
            forward_retry,
        ));
        let rebalancer = Arc::new(FailoverRebalancer::new(
            membership.clone(),
            replication.clone(),
            store.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            transport,
            membership,
            replication,
            rebalancer,
            forward_retry,
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// A node backed by an in-memory store sized by `max_sessions` and the
    /// system clock.
    pub fn in_memory(config: ClusterConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let store = Arc::new(InMemorySessionStore::new(config.max_sessions));
        Self::new(config, store, transport, Arc::new(SystemClock))
    }

    pub fn node_id(&self) -> &str {
        self.membership.local_id()
    }

    pub fn address(&self) -> &str {
        self.membership.local_addr()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind to the transport, join through the configured seeds and start
    /// the background tasks.
    pub async fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::config(format!(
                "Node {} was shut down and cannot be restarted",
                self.node_id()
            )));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.transport.bind(self.address(), Arc::new(self.clone())) {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.membership.touch_local(self.owned_count(), self.store.stats().approx_bytes);
        let contacted = self.membership.join(&self.config.seeds).await;
        self.rebalancer.catch_up().await;

        self.spawn_ring_listener();
        self.spawn_periodic("heartbeat", self.config.heartbeat_interval(), |node| async move {
            node.heartbeat_round().await;
        });
        self.spawn_periodic("gossip", self.config.gossip_interval(), |node| async move {
            node.gossip_round().await;
        });
        self.spawn_periodic("sweep", self.config.gossip_interval(), |node| async move {
            node.cleanup_dead_nodes().await;
        });
        self.spawn_periodic("sync", self.config.sync_interval(), |node| async move {
            node.sync_round().await;
        });

        info!(
            "Node {} started at {} ({} of {} seeds reachable, {} healthy nodes)",
            self.node_id(),
            self.address(),
            contacted,
            self.config.seeds.len(),
            self.membership.healthy_count()
        );
        Ok(())
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, tick: F)
    where
        F: Fn(ClusterOrchestrator) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let node = self.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => tick(node.clone()).await,
                }
            }
            debug!("{} task stopped on {}", name, node.node_id());
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_ring_listener(&self) {
        let node = self.clone();
        let cancel = self.cancel.clone();
        let mut changes = self.membership.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(_) | Err(RecvError::Lagged(_)) => {
                            node.rebalancer.catch_up().await;
                        }
                        Err(RecvError::Closed) => {
                            error!("Ring change channel closed on {}", node.node_id());
                            break;
                        }
                    },
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Leave the cluster. Sessions are handed to their next owners first
    /// when `handoff_on_shutdown` is set.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        if self.config.handoff_on_shutdown {
            self.rebalancer.handoff_owned().await;
        }
        self.stop().await;
        info!("Node {} shut down", self.node_id());
        Ok(())
    }

    /// Stop abruptly, as a crash would: no handoff.
    pub async fn halt(&self) {
        if self.is_running() {
            self.stop().await;
            warn!("Node {} halted", self.node_id());
        }
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.transport.unbind(self.address());

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Background task on {} failed: {}", self.node_id(), e);
                }
            }
        }
    }

    /// Run `op` at the owner of `id`, forwarding when that is another node.
    async fn route(&self, id: &str, op: WriteOp) -> Result<OpReply> {
        let owner = match self.membership.ring().get_node(id) {
            Ok(owner) => owner.to_string(),
            // Local-only mode
            Err(OrchestratorError::NoAvailableNodes) => self.node_id().to_string(),
            Err(e) => return Err(e),
        };
        if owner == self.node_id() {
            return self.replication.write(op).await;
        }

        match self
            .replication
            .send_op(&owner, op.into_session_op(), self.forward_retry)
            .await
        {
            Ok(OpReply::Failed(e)) => Err(e),
            Ok(reply) => Ok(reply),
            Err(e) if e.is_retryable() || matches!(e, OrchestratorError::NodeNotFound(_)) => {
                warn!("Owner {} of session {} unreachable: {}", owner, id, e);
                Err(OrchestratorError::OwnerUnreachable(format!("{} (session {})", owner, id)))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn create_session(&self, mut config: SessionConfig) -> Result<Session> {
        let id = config
            .id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        match self.route(&id, WriteOp::Create(config)).await? {
            OpReply::Session(Some(session)) => Ok(session),
            other => Err(OrchestratorError::protocol(format!("Unexpected create reply {:?}", other))),
        }
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.replication.read(id).await
    }

    pub async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<Option<Session>> {
        let op = WriteOp::Update {
            id: id.to_string(),
            patch,
        };
        match self.route(id, op).await? {
            OpReply::Session(session) => Ok(session),
            other => Err(OrchestratorError::protocol(format!("Unexpected update reply {:?}", other))),
        }
    }

    /// Returns false when there was nothing to delete.
    pub async fn delete_session(&self, id: &str) -> Result<bool> {
        match self.route(id, WriteOp::Delete { id: id.to_string() }).await? {
            OpReply::Deleted(deleted) => Ok(deleted),
            other => Err(OrchestratorError::protocol(format!("Unexpected delete reply {:?}", other))),
        }
    }

    /// Sessions tracked here whose owner on the current ring is this node.
    fn owned_count(&self) -> usize {
        let ring = self.membership.ring();
        let directory = self.replication.directory();
        if ring.is_empty() {
            return directory.owned_by(self.node_id());
        }
        directory
            .ids()
            .iter()
            .filter(|id| ring.get_node(id).map(|owner| owner == self.node_id()).unwrap_or(false))
            .count()
    }

    pub fn get_cluster_metrics(&self) -> ClusterMetrics {
        let directory = self.replication.directory();
        ClusterMetrics::aggregate(
            &self.membership.snapshot(),
            self.node_id(),
            self.owned_count(),
            directory.under_replicated(self.node_id()),
            directory.degraded(),
            self.membership.ring().version(),
        )
    }

    pub fn get_local_metrics(&self) -> LocalMetrics {
        let store = self.store.stats();
        LocalMetrics {
            node_id: self.node_id().to_string(),
            owned_sessions: self.owned_count(),
            stored_sessions: store.sessions,
            tracked_placements: self.replication.directory().len(),
            stale_copies: self.rebalancer.stale_count(),
            store,
            replication: self.replication.stats(),
            rebalance_runs: self.rebalancer.runs(),
            cluster: self.get_cluster_metrics(),
        }
    }

    pub fn ring(&self) -> Arc<HashRing> {
        self.membership.ring()
    }

    pub fn membership(&self) -> &Arc<MembershipTable> {
        &self.membership
    }

    pub fn rebalancer(&self) -> &Arc<FailoverRebalancer> {
        &self.rebalancer
    }

    pub fn session_placement(&self, id: &str) -> Option<SessionPlacement> {
        self.replication.directory().get(id)
    }

    /// Force a node record into the local view.
    pub async fn add_node(&self, node: ClusterNode) -> Result<Option<RebalanceReport>> {
        self.membership.add_node(node)?;
        Ok(self.rebalancer.catch_up().await)
    }

    /// Declare a node dead in the local view.
    pub async fn remove_node(&self, id: &str) -> Result<Option<RebalanceReport>> {
        self.membership.remove_node(id)?;
        Ok(self.rebalancer.catch_up().await)
    }

    pub async fn heartbeat_round(&self) -> usize {
        self.membership
            .heartbeat_round(self.owned_count(), self.store.stats().approx_bytes)
            .await
    }

    pub async fn gossip_round(&self) -> usize {
        self.membership.gossip_round().await
    }

    /// Sweep membership and reconcile ownership with the resulting ring.
    pub async fn cleanup_dead_nodes(&self) -> SweepReport {
        let report = self.membership.cleanup_dead_nodes();
        if !report.is_empty() {
            debug!("Sweep on {}: {:?}", self.node_id(), report);
        }
        self.rebalancer.catch_up().await;
        report
    }

    pub async fn sync_round(&self) -> SyncReport {
        SyncReport {
            replicas_pushed: self.replication.sync_replicas().await,
            stale_evicted: self.rebalancer.reclaim_stale(self.config.stale_grace()).await,
        }
    }

    async fn handle_forward(&self, op: SessionOp) -> OpReply {
        let name = op.name();
        let result = match op {
            SessionOp::Create { .. } | SessionOp::Update { .. } | SessionOp::Delete { .. } => {
                match WriteOp::from_session_op(op) {
                    Some(write) => self.replication.write(write).await,
                    None => Err(OrchestratorError::protocol("Not a write")),
                }
            }
            other => self.replication.apply_replica(other),
        };
        result.unwrap_or_else(|e| {
            debug!("Forwarded {} failed on {}: {}", name, self.node_id(), e);
            OpReply::Failed(e)
        })
    }
}

#[async_trait]
impl MessageHandler for ClusterOrchestrator {
    async fn handle(&self, envelope: Envelope) -> Result<Envelope> {
        let ack = match envelope.payload {
            MessagePayload::Forward(op) => Ack::Reply(self.handle_forward(op).await),
            MessagePayload::Ack(_) => {
                return Err(OrchestratorError::protocol(format!(
                    "Unsolicited ack from {}",
                    envelope.source
                )))
            }
            _ => self.membership.handle_incoming_message(envelope)?,
        };
        Ok(Envelope::new(
            self.node_id(),
            self.address(),
            MessagePayload::Ack(ack),
            self.membership.now_millis(),
        ))
    }
}
