//! Session replication.
//!
//! Writes are applied at the owner's store and decided by that result alone.
//! The resulting image is then pushed best-effort to the rest of the replica
//! set. Reads always start at the owner derived from the current ring and fall
//! through the replica set in ring order.

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cluster::membership::MembershipTable;
use crate::cluster::ring::ReplicaSet;
use crate::cluster::transport::{Envelope, MessagePayload, OpReply, RetryPolicy, SessionOp, Transport};
use crate::cluster::types::{Session, SessionConfig, SessionPatch, SessionPlacement};
use crate::error::{OrchestratorError, Result};
use crate::store::LocalSessionStore;

/// Placement metadata for every session this node owns or replicates.
#[derive(Debug, Default)]
pub struct SessionDirectory {
    placements: DashMap<String, SessionPlacement>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<SessionPlacement> {
        self.placements.get(id).map(|p| p.value().clone())
    }

    pub fn record(&self, placement: SessionPlacement) {
        self.placements.insert(placement.session_id.clone(), placement);
    }

    pub fn remove(&self, id: &str) -> Option<SessionPlacement> {
        self.placements.remove(id).map(|(_, p)| p)
    }

    pub fn set_degraded(&self, id: &str, degraded: bool) {
        if let Some(mut placement) = self.placements.get_mut(id) {
            placement.degraded = degraded;
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.placements.iter().map(|p| p.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    pub fn owned_by(&self, node_id: &str) -> usize {
        self.placements.iter().filter(|p| p.owner == node_id).count()
    }

    pub fn under_replicated(&self, node_id: &str) -> usize {
        self.placements
            .iter()
            .filter(|p| p.owner == node_id && p.under_replicated)
            .count()
    }

    pub fn degraded(&self) -> usize {
        self.placements.iter().filter(|p| p.degraded).count()
    }
}

/// A client write, executed by the owner.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Create(SessionConfig),
    Update { id: String, patch: SessionPatch },
    Delete { id: String },
}

impl WriteOp {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            WriteOp::Create(config) => config.id.as_deref(),
            WriteOp::Update { id, .. } | WriteOp::Delete { id } => Some(id),
        }
    }

    pub fn into_session_op(self) -> SessionOp {
        match self {
            WriteOp::Create(config) => SessionOp::Create { config },
            WriteOp::Update { id, patch } => SessionOp::Update { id, patch },
            WriteOp::Delete { id } => SessionOp::Delete { id },
        }
    }

    pub fn from_session_op(op: SessionOp) -> Option<WriteOp> {
        match op {
            SessionOp::Create { config } => Some(WriteOp::Create(config)),
            SessionOp::Update { id, patch } => Some(WriteOp::Update { id, patch }),
            SessionOp::Delete { id } => Some(WriteOp::Delete { id }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReplicationStats {
    pub replica_writes: u64,
    pub replica_failures: u64,
    pub read_repairs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    replica_writes: AtomicU64,
    replica_failures: AtomicU64,
    read_repairs: AtomicU64,
}

#[derive(Debug)]
pub struct ReplicationCoordinator {
    node_id: String,
    replication_factor: usize,
    membership: Arc<MembershipTable>,
    store: Arc<dyn LocalSessionStore>,
    transport: Arc<dyn Transport>,
    directory: Arc<SessionDirectory>,
    retry: RetryPolicy,
    counters: Counters,
    /// Recently deleted ids and when; offered stale copies of these are refused
    deleted: DashMap<String, u64>,
}

impl ReplicationCoordinator {
    pub fn new(
        replication_factor: usize,
        membership: Arc<MembershipTable>,
        store: Arc<dyn LocalSessionStore>,
        transport: Arc<dyn Transport>,
        directory: Arc<SessionDirectory>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            node_id: membership.local_id().to_string(),
            replication_factor: replication_factor.max(1),
            membership,
            store,
            transport,
            directory,
            retry,
            counters: Counters::default(),
            deleted: DashMap::new(),
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    pub fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            replica_writes: self.counters.replica_writes.load(Ordering::Relaxed),
            replica_failures: self.counters.replica_failures.load(Ordering::Relaxed),
            read_repairs: self.counters.read_repairs.load(Ordering::Relaxed),
        }
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.deleted.contains_key(id)
    }

    fn remember_delete(&self, id: &str) {
        self.deleted.insert(id.to_string(), self.membership.now_millis());
    }

    /// Forget deletes older than the tombstone ttl. Returns how many went.
    pub fn purge_deletes(&self) -> usize {
        let now = self.membership.now_millis();
        let ttl = self.membership.settings().tombstone_ttl.as_millis() as u64;
        let before = self.deleted.len();
        self.deleted.retain(|_, at| now.saturating_sub(*at) < ttl);
        before - self.deleted.len()
    }

    /// Replica set for a session id on the current ring.
    pub fn replica_set(&self, id: &str) -> ReplicaSet {
        self.membership.ring().get_nodes(id, self.replication_factor)
    }

    /// Placement of a session this node is writing as owner, plus the
    /// replicas to push to.
    fn owner_placement(&self, session: &Session) -> SessionPlacement {
        let ring = self.membership.ring();
        let set = ring.get_nodes(&session.id, self.replication_factor);
        let replicas: Vec<String> = set
            .nodes
            .iter()
            .filter(|n| **n != self.node_id)
            .take(self.replication_factor - 1)
            .cloned()
            .collect();
        let under_replicated = replicas.len() + 1 < self.replication_factor;

        if under_replicated {
            let warning = OrchestratorError::UnderReplicated {
                available: replicas.len() + 1,
                required: self.replication_factor,
            };
            debug!("Session {}: {}", session.id, warning);
        }

        SessionPlacement {
            session_id: session.id.clone(),
            owner: self.node_id.clone(),
            replicas,
            under_replicated,
            degraded: false,
            summary: session.summary(),
            ring_version: ring.version(),
        }
    }

    fn envelope(&self, op: SessionOp) -> Envelope {
        Envelope::new(
            &self.node_id,
            self.membership.local_addr(),
            MessagePayload::Forward(op),
            self.membership.now_millis(),
        )
    }

    /// Send one operation to one node and unwrap its reply.
    pub async fn send_op(&self, node_id: &str, op: SessionOp, policy: RetryPolicy) -> Result<OpReply> {
        let addr = self
            .membership
            .address_of(node_id)
            .ok_or_else(|| OrchestratorError::NodeNotFound(node_id.to_string()))?;
        let reply = policy.send(self.transport.as_ref(), &addr, self.envelope(op)).await?;
        reply.into_reply()
    }

    /// Best-effort push of `op` to `targets`. Failures are logged and counted,
    /// never returned; the successful replies are.
    async fn fan_out(&self, targets: &[String], op: SessionOp) -> Vec<OpReply> {
        let sends = targets.iter().map(|target| {
            let op = op.clone();
            async move {
                let result = match self.send_op(target, op, self.retry).await {
                    Ok(OpReply::Failed(e)) => Err(e),
                    Ok(reply) => Ok(reply),
                    Err(e) => Err(e),
                };
                result.map_err(|e| (target, e))
            }
        });

        let mut succeeded = Vec::new();
        for result in join_all(sends).await {
            match result {
                Ok(reply) => {
                    self.counters.replica_writes.fetch_add(1, Ordering::Relaxed);
                    succeeded.push(reply);
                }
                Err((target, e)) => {
                    self.counters.replica_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Replica {} failed {}: {}", target, op.name(), e);
                }
            }
        }
        succeeded
    }

    async fn replicate(&self, session: &Session, placement: &SessionPlacement) -> usize {
        if placement.replicas.is_empty() {
            return 0;
        }
        let op = SessionOp::Replicate {
            session: session.clone(),
            placement: placement.clone(),
        };
        self.fan_out(&placement.replicas, op).await.len()
    }

    /// Push `session` to every node of `placement` other than this one.
    /// Used when ownership moves away from this node.
    pub async fn hand_over(&self, session: &Session, placement: &SessionPlacement) -> usize {
        let targets: Vec<String> = placement.nodes().filter(|n| **n != self.node_id).cloned().collect();
        if targets.is_empty() {
            return 0;
        }
        let op = SessionOp::Replicate {
            session: session.clone(),
            placement: placement.clone(),
        };
        self.fan_out(&targets, op).await.len()
    }

    /// Store `session` locally as owner and push it to the replica set.
    pub async fn adopt(&self, session: &Session) -> Result<SessionPlacement> {
        self.store.put_session(session.clone())?;
        let placement = self.owner_placement(session);
        self.directory.record(placement.clone());
        self.replicate(session, &placement).await;
        Ok(placement)
    }

    /// Apply a client write as the session's owner.
    pub async fn write(&self, op: WriteOp) -> Result<OpReply> {
        match op {
            WriteOp::Create(mut config) => {
                if config.id.is_none() {
                    config.id = Some(uuid::Uuid::new_v4().to_string());
                }
                let session = self.store.create_session(config)?;
                self.deleted.remove(&session.id);
                let placement = self.owner_placement(&session);
                if placement.under_replicated {
                    warn!(
                        "Session {} created under-replicated ({} of {})",
                        session.id,
                        placement.replicas.len() + 1,
                        self.replication_factor
                    );
                }
                self.directory.record(placement.clone());
                self.replicate(&session, &placement).await;
                Ok(OpReply::Session(Some(session)))
            }
            WriteOp::Update { id, patch } => {
                if self.store.get_session(&id)?.is_none() {
                    let candidates = self.replica_set(&id).nodes;
                    if let Some(session) = self.fetch(&id, &candidates).await {
                        self.store.put_session(session)?;
                    }
                }
                match self.store.update_session(&id, patch)? {
                    Some(session) => {
                        let placement = self.owner_placement(&session);
                        self.directory.record(placement.clone());
                        self.replicate(&session, &placement).await;
                        Ok(OpReply::Session(Some(session)))
                    }
                    None => Ok(OpReply::Session(None)),
                }
            }
            WriteOp::Delete { id } => {
                let mut deleted = self.store.delete_session(&id)?;
                self.remember_delete(&id);
                let known = self.directory.remove(&id).map(|p| p.replicas).unwrap_or_default();
                let mut targets: Vec<String> = self
                    .replica_set(&id)
                    .nodes
                    .into_iter()
                    .filter(|n| *n != self.node_id)
                    .collect();
                for node in known {
                    if !targets.contains(&node) && node != self.node_id {
                        targets.push(node);
                    }
                }
                let replies = self.fan_out(&targets, SessionOp::DropReplica { id }).await;
                // A new owner that never received the image still reports
                // whether the cluster held the session.
                deleted |= replies.iter().any(|r| matches!(r, OpReply::Deleted(true)));
                Ok(OpReply::Deleted(deleted))
            }
        }
    }

    /// Apply a replica-side operation pushed by another node.
    pub fn apply_replica(&self, op: SessionOp) -> Result<OpReply> {
        match op {
            SessionOp::Replicate { session, placement } => match self.store.put_session(session) {
                Ok(stored) => {
                    self.directory.record(SessionPlacement { degraded: false, ..placement });
                    Ok(OpReply::Stored(stored))
                }
                Err(e) => {
                    warn!("Keeping metadata only for session {}: {}", placement.session_id, e);
                    self.directory.record(SessionPlacement { degraded: true, ..placement });
                    Ok(OpReply::Failed(e))
                }
            },
            SessionOp::Offer { session, .. } if self.is_deleted(&session.id) => {
                debug!("Refusing offered copy of deleted session {}", session.id);
                Ok(OpReply::Deleted(true))
            }
            SessionOp::Offer { session, .. } => {
                let id = session.id.clone();
                let placement = self.owner_placement(&session);
                match self.store.insert_if_absent(session) {
                    Ok(inserted) => {
                        if inserted {
                            info!("Accepted offered session {}", id);
                            self.directory.record(placement);
                        }
                        Ok(OpReply::Stored(true))
                    }
                    Err(e) => Ok(OpReply::Failed(e)),
                }
            }
            SessionOp::DropReplica { id } => {
                let deleted = self.store.delete_session(&id)?;
                self.directory.remove(&id);
                self.remember_delete(&id);
                Ok(OpReply::Deleted(deleted))
            }
            SessionOp::Get { id } => Ok(OpReply::Session(self.store.get_session(&id)?)),
            other => Err(OrchestratorError::protocol(format!(
                "{} is not a replica operation",
                other.name()
            ))),
        }
    }

    /// Fetch a copy of `id` from the first candidate holding one.
    async fn fetch(&self, id: &str, candidates: &[String]) -> Option<Session> {
        for candidate in candidates.iter().filter(|c| **c != self.node_id) {
            match self.send_op(candidate, SessionOp::Get { id: id.to_string() }, self.retry).await {
                Ok(OpReply::Session(Some(session))) => {
                    debug!("Fetched session {} from {}", id, candidate);
                    return Some(session);
                }
                Ok(_) => {}
                Err(e) => debug!("Fetch of {} from {} failed: {}", id, candidate, e),
            }
        }
        None
    }

    /// Fetch a copy of `id` and store it locally.
    pub async fn pull(&self, id: &str, candidates: &[String]) -> Option<Session> {
        let session = self.fetch(id, candidates).await?;
        if let Err(e) = self.store.put_session(session.clone()) {
            warn!("Pulled session {} but could not store it: {}", id, e);
        }
        self.counters.read_repairs.fetch_add(1, Ordering::Relaxed);
        Some(session)
    }

    /// Read a session from the owner, falling through the replica set.
    pub async fn read(&self, id: &str) -> Result<Option<Session>> {
        let set = self.replica_set(id);
        let mut answered = set.nodes.is_empty();

        for (position, node) in set.nodes.iter().enumerate() {
            let found = if *node == self.node_id {
                answered = true;
                self.store.get_session(id)?
            } else {
                match self.send_op(node, SessionOp::Get { id: id.to_string() }, self.retry).await {
                    Ok(OpReply::Session(found)) => {
                        answered = true;
                        found
                    }
                    Ok(OpReply::Failed(e)) => return Err(e),
                    Ok(other) => {
                        return Err(OrchestratorError::protocol(format!("Unexpected read reply {:?}", other)))
                    }
                    Err(e) => {
                        debug!("Read of {} from {} failed: {}", id, node, e);
                        None
                    }
                }
            };

            if let Some(session) = found {
                if position > 0 && set.owner() == Some(self.node_id.as_str()) {
                    // Owner missed it: keep the copy the replica returned.
                    match self.store.put_session(session.clone()) {
                        Ok(_) => {
                            self.directory.record(self.owner_placement(&session));
                            self.counters.read_repairs.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => warn!("Read repair of session {} failed: {}", id, e),
                    }
                }
                return Ok(Some(session));
            }
        }

        // A copy outside the current replica set is still better than nothing.
        if !set.contains(&self.node_id) {
            if let Some(session) = self.store.get_session(id)? {
                return Ok(Some(session));
            }
        }

        if let Some(placement) = self.directory.get(id) {
            if placement.degraded {
                return Ok(Some(placement.summary.degraded_session()));
            }
        }

        if answered {
            Ok(None)
        } else {
            Err(OrchestratorError::OwnerUnreachable(id.to_string()))
        }
    }

    /// Anti-entropy: re-push every owned session to its current replicas.
    pub async fn sync_replicas(&self) -> usize {
        self.purge_deletes();
        let mut pushed = 0;
        for id in self.directory.ids() {
            let owner = match self.membership.ring().get_node(&id) {
                Ok(owner) => owner.to_string(),
                Err(_) => continue,
            };
            if owner != self.node_id {
                continue;
            }
            let session = match self.store.get_session(&id) {
                Ok(Some(session)) => session,
                _ => continue,
            };
            let placement = self.owner_placement(&session);
            self.directory.record(placement.clone());
            pushed += self.replicate(&session, &placement).await;
        }
        if pushed > 0 {
            debug!("Anti-entropy pushed {} replica images", pushed);
        }
        pushed
    }
}
