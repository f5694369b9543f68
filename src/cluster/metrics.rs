use serde::{Deserialize, Serialize};

use crate::cluster::membership::MembershipSnapshot;
use crate::cluster::replication::ReplicationStats;
use crate::cluster::types::NodeStatus;
use crate::store::StoreStats;

/// Per-node row of the cluster metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDetail {
    pub id: String,
    pub status: NodeStatus,
    /// Sessions the node owns
    pub sessions: usize,
    pub memory_usage: u64,
    pub last_heartbeat: u64,
}

/// Cluster-wide figures as seen from one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetrics {
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    /// Sum of primary-owned sessions over healthy nodes
    pub total_sessions: usize,
    pub average_sessions_per_node: f64,
    pub under_replicated_sessions: usize,
    pub degraded_sessions: usize,
    pub ring_version: u64,
    pub node_details: Vec<NodeDetail>,
}

impl ClusterMetrics {
    /// Aggregate over `view`, substituting live figures for the local node.
    pub fn aggregate(
        view: &MembershipSnapshot,
        local_id: &str,
        local_owned: usize,
        under_replicated: usize,
        degraded: usize,
        ring_version: u64,
    ) -> Self {
        let node_details: Vec<NodeDetail> = view
            .members()
            .map(|node| NodeDetail {
                id: node.id.clone(),
                status: node.status,
                sessions: if node.id == local_id {
                    local_owned
                } else {
                    node.session_count
                },
                memory_usage: node.memory_usage,
                last_heartbeat: node.last_heartbeat,
            })
            .collect();

        let healthy: Vec<&NodeDetail> = node_details
            .iter()
            .filter(|d| d.status == NodeStatus::Healthy)
            .collect();
        let total_sessions: usize = healthy.iter().map(|d| d.sessions).sum();
        let average_sessions_per_node = if healthy.is_empty() {
            0.0
        } else {
            total_sessions as f64 / healthy.len() as f64
        };

        Self {
            total_nodes: node_details.len(),
            healthy_nodes: healthy.len(),
            total_sessions,
            average_sessions_per_node,
            under_replicated_sessions: under_replicated,
            degraded_sessions: degraded,
            ring_version,
            node_details,
        }
    }
}

/// Node-local counts plus this node's view of the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMetrics {
    pub node_id: String,
    pub owned_sessions: usize,
    /// Sessions held in the local store, owned or not
    pub stored_sessions: usize,
    /// Placement entries this node tracks
    pub tracked_placements: usize,
    pub stale_copies: usize,
    pub store: StoreStats,
    pub replication: ReplicationStats,
    pub rebalance_runs: u64,
    pub cluster: ClusterMetrics,
}
