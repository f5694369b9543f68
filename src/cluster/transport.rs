//! Messaging channel between nodes.
//!
//! Delivery is at-most-once and unordered; callers retry with backoff. The
//! [`Transport`] trait is all the cluster layer depends on, [`LocalNetwork`]
//! is the in-process implementation used by tests and simulations.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::cluster::types::{ClusterNode, Session, SessionConfig, SessionPatch, SessionPlacement};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Heartbeat,
    Gossip,
    ForwardOp,
    Ack,
}

/// A session operation carried by a `forward-op` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SessionOp {
    /// Primary write: the receiver acts as owner
    Create { config: SessionConfig },
    Update { id: String, patch: SessionPatch },
    Delete { id: String },
    /// Read from the receiver's local store only
    Get { id: String },
    /// Replica image pushed by the owner
    Replicate { session: Session, placement: SessionPlacement },
    /// Copy held by a former owner, stored only if absent
    Offer { session: Session, placement: SessionPlacement },
    /// Replica removal after a delete at the owner
    DropReplica { id: String },
}

impl SessionOp {
    pub fn name(&self) -> &'static str {
        match self {
            SessionOp::Create { .. } => "create",
            SessionOp::Update { .. } => "update",
            SessionOp::Delete { .. } => "delete",
            SessionOp::Get { .. } => "get",
            SessionOp::Replicate { .. } => "replicate",
            SessionOp::Offer { .. } => "offer",
            SessionOp::DropReplica { .. } => "drop_replica",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionOp::Create { config } => config.id.as_deref(),
            SessionOp::Update { id, .. }
            | SessionOp::Delete { id }
            | SessionOp::Get { id }
            | SessionOp::DropReplica { id } => Some(id),
            SessionOp::Replicate { session, .. } | SessionOp::Offer { session, .. } => Some(&session.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "value", rename_all = "snake_case")]
pub enum OpReply {
    Session(Option<Session>),
    Deleted(bool),
    Stored(bool),
    Failed(OrchestratorError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ack", content = "value", rename_all = "snake_case")]
pub enum Ack {
    Empty,
    /// The responder's membership view, for push-pull gossip
    Members(Vec<ClusterNode>),
    Reply(OpReply),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MessagePayload {
    Heartbeat(ClusterNode),
    Gossip(Vec<ClusterNode>),
    Forward(SessionOp),
    Ack(Ack),
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::Heartbeat(_) => MessageKind::Heartbeat,
            MessagePayload::Gossip(_) => MessageKind::Gossip,
            MessagePayload::Forward(_) => MessageKind::ForwardOp,
            MessagePayload::Ack(_) => MessageKind::Ack,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Sending node id
    pub source: String,
    /// Address the sender can be reached at
    pub source_addr: String,
    pub payload: MessagePayload,
    /// Sender's clock, milliseconds since the epoch
    pub timestamp: u64,
}

impl Envelope {
    pub fn new(source: impl Into<String>, source_addr: impl Into<String>, payload: MessagePayload, timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: payload.kind(),
            source: source.into(),
            source_addr: source_addr.into(),
            payload,
            timestamp,
        }
    }

    pub fn into_ack(self) -> Result<Ack> {
        match self.payload {
            MessagePayload::Ack(ack) => Ok(ack),
            other => Err(OrchestratorError::protocol(format!(
                "Expected ack, got {:?}",
                other.kind()
            ))),
        }
    }

    pub fn into_reply(self) -> Result<OpReply> {
        match self.into_ack()? {
            Ack::Reply(reply) => Ok(reply),
            other => Err(OrchestratorError::protocol(format!(
                "Expected operation reply, got {:?}",
                other
            ))),
        }
    }
}

/// Receives envelopes addressed to a bound node and produces the ack.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<Envelope>;
}

#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Deliver `envelope` to the node at `addr` and wait for its ack.
    async fn send(&self, addr: &str, envelope: Envelope) -> Result<Envelope>;

    fn bind(&self, addr: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;

    fn unbind(&self, addr: &str);
}

/// Per-attempt timeout with exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration, timeout: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            timeout,
        }
    }

    /// A single attempt, no retries.
    pub fn once(timeout: Duration) -> Self {
        Self::new(0, Duration::ZERO, timeout)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(1u32 << attempt.min(16))
    }

    /// Send with retries; only channel failures are retried.
    pub async fn send(&self, transport: &dyn Transport, addr: &str, envelope: Envelope) -> Result<Envelope> {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.timeout, transport.send(addr, envelope.clone())).await {
                Ok(result) => result,
                Err(_) => Err(OrchestratorError::Timeout(format!(
                    "{:?} to {} after {:?}",
                    envelope.kind, addr, self.timeout
                ))),
            };

            match result {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    trace!("Retrying {:?} to {} in {:?}: {}", envelope.kind, addr, delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// In-process network with failure injection.
///
/// Every envelope and ack is encoded to JSON and decoded again, so the
/// in-process path exercises the same encoding a socket transport would.
#[derive(Default)]
pub struct LocalNetwork {
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    down: RwLock<HashSet<String>>,
    partitions: RwLock<HashSet<(String, String)>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("bound", &self.handlers.len())
            .field("delivered", &self.delivered.load(Ordering::Relaxed))
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drop all traffic to and from `addr`.
    pub fn set_down(&self, addr: &str, down: bool) {
        let mut set = self.down.write();
        if down {
            set.insert(addr.to_string());
        } else {
            set.remove(addr);
        }
    }

    /// Drop traffic between two addresses, both directions.
    pub fn partition(&self, a: &str, b: &str) {
        let mut partitions = self.partitions.write();
        partitions.insert((a.to_string(), b.to_string()));
        partitions.insert((b.to_string(), a.to_string()));
    }

    pub fn heal(&self) {
        self.partitions.write().clear();
        self.down.write().clear();
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn blocked(&self, from: &str, to: &str) -> bool {
        let down = self.down.read();
        down.contains(from)
            || down.contains(to)
            || self.partitions.read().contains(&(from.to_string(), to.to_string()))
    }

    fn drop_message(&self, reason: &str, addr: &str) -> OrchestratorError {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        OrchestratorError::transport(format!("{}: {}", reason, addr))
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(&self, addr: &str, envelope: Envelope) -> Result<Envelope> {
        if self.blocked(&envelope.source_addr, addr) {
            return Err(self.drop_message("Unreachable", addr));
        }
        let handler = match self.handlers.get(addr) {
            Some(handler) => handler.value().clone(),
            None => return Err(self.drop_message("No node bound at", addr)),
        };

        let wire = serde_json::to_vec(&envelope)?;
        let decoded: Envelope = serde_json::from_slice(&wire)?;
        let ack = handler.handle(decoded).await?;

        // The ack crosses the same link on the way back.
        if self.blocked(addr, &envelope.source_addr) {
            return Err(self.drop_message("Ack lost from", addr));
        }
        let wire = serde_json::to_vec(&ack)?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(serde_json::from_slice(&wire)?)
    }

    fn bind(&self, addr: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if self.handlers.contains_key(addr) {
            return Err(OrchestratorError::transport(format!("Address already bound: {}", addr)));
        }
        debug!("Bound node at {}", addr);
        self.handlers.insert(addr.to_string(), handler);
        Ok(())
    }

    fn unbind(&self, addr: &str) {
        if self.handlers.remove(addr).is_some() {
            debug!("Unbound node at {}", addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, envelope: Envelope) -> Result<Envelope> {
            Ok(Envelope::new(
                "echo",
                "echo:1",
                MessagePayload::Ack(Ack::Members(match envelope.payload {
                    MessagePayload::Gossip(members) => members,
                    _ => Vec::new(),
                })),
                envelope.timestamp,
            ))
        }
    }

    fn gossip(from_addr: &str) -> Envelope {
        let node = ClusterNode::new("a", "a", 1);
        Envelope::new("a", from_addr, MessagePayload::Gossip(vec![node]), 7)
    }

    #[test]
    fn test_envelope_wire_format() {
        let json = serde_json::to_value(gossip("a:1")).unwrap();
        assert_eq!(json["type"], "gossip");
        assert_eq!(json["source"], "a");
        assert_eq!(json["timestamp"], 7);
        assert_eq!(json["payload"]["type"], "gossip");
    }

    #[tokio::test]
    async fn test_delivery_round_trips_through_json() {
        let network = LocalNetwork::new();
        network.bind("echo:1", Arc::new(Echo)).unwrap();

        let ack = network.send("echo:1", gossip("a:1")).await.unwrap();
        assert_eq!(ack.kind, MessageKind::Ack);
        match ack.into_ack().unwrap() {
            Ack::Members(members) => assert_eq!(members[0].id, "a"),
            other => panic!("unexpected ack {:?}", other),
        }
        assert_eq!(network.delivered(), 1);
    }

    #[tokio::test]
    async fn test_down_and_partitioned_links_drop() {
        let network = LocalNetwork::new();
        network.bind("echo:1", Arc::new(Echo)).unwrap();

        network.partition("a:1", "echo:1");
        assert!(network.send("echo:1", gossip("a:1")).await.is_err());
        assert!(network.send("echo:1", gossip("b:1")).await.is_ok());

        network.heal();
        network.set_down("echo:1", true);
        assert!(network.send("echo:1", gossip("b:1")).await.is_err());
        assert!(network.send("nobody:1", gossip("b:1")).await.is_err());
        assert_eq!(network.dropped(), 3);
    }

    #[tokio::test]
    async fn test_retry_policy_gives_up_after_max_retries() {
        let network = LocalNetwork::new();
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(50));

        let err = policy.send(network.as_ref(), "nobody:1", gossip("a:1")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Transport(_)));
        assert_eq!(network.dropped(), 3, "one attempt plus two retries");
        assert_eq!(policy.backoff(3), Duration::from_millis(8));
    }

    #[test]
    fn test_binding_twice_fails() {
        let network = LocalNetwork::new();
        network.bind("echo:1", Arc::new(Echo)).unwrap();
        assert!(network.bind("echo:1", Arc::new(Echo)).is_err());
        network.unbind("echo:1");
        assert!(network.bind("echo:1", Arc::new(Echo)).is_ok());
    }
}
