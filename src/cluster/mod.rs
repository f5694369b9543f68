//! Cluster coordination: placement, membership, replication and failover.

pub mod clock;
pub mod membership;
pub mod metrics;
pub mod orchestrator;
pub mod rebalance;
pub mod replication;
pub mod ring;
pub mod transport;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use membership::{MembershipSettings, MembershipSnapshot, MembershipTable, RingChange, SweepReport};
pub use metrics::{ClusterMetrics, LocalMetrics, NodeDetail};
pub use orchestrator::{ClusterOrchestrator, SyncReport};
pub use rebalance::{FailoverRebalancer, RebalanceReport};
pub use replication::{ReplicationCoordinator, SessionDirectory, WriteOp};
pub use ring::{HashRing, ReplicaSet, RingToken, SharedRing};
pub use transport::{Envelope, LocalNetwork, MessageHandler, MessageKind, RetryPolicy, Transport};
pub use types::{
    ClusterNode, NodeStatus, Session, SessionConfig, SessionPatch, SessionPlacement, SessionStatus, SessionSummary,
};
