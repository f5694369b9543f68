//! Cluster Types
//!
//! Core types shared by the coordination layer:
//! - Node identity, health state and advertised load
//! - Sessions as stored by the local store
//! - Placement metadata the layer keeps next to each session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Node health state, in protocol order.
///
/// A node only moves forward through these states, except that a newer
/// heartbeat for a `Suspect` or `Dead` node brings it back to `Healthy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Known but never heard from directly
    New,
    /// Heartbeating normally; the only state that holds ring tokens
    Healthy,
    /// Missed enough gossip intervals to be doubted
    Suspect,
    /// Silent past the heartbeat timeout
    Dead,
    /// Purged by a cleanup pass; kept as a tombstone
    Removed,
}

impl NodeStatus {
    /// Removed nodes are not part of the cluster view anymore.
    pub fn is_member(self) -> bool {
        self != NodeStatus::Removed
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::New => write!(f, "NEW"),
            NodeStatus::Healthy => write!(f, "HEALTHY"),
            NodeStatus::Suspect => write!(f, "SUSPECT"),
            NodeStatus::Dead => write!(f, "DEAD"),
            NodeStatus::Removed => write!(f, "REMOVED"),
        }
    }
}

/// A member of the cluster as seen by one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub advertised_host: String,
    pub port: u16,
    pub status: NodeStatus,
    /// Milliseconds since the epoch, stamped by the node itself
    pub last_heartbeat: u64,
    /// Sessions this node owns, as it last reported
    pub session_count: usize,
    /// Approximate bytes held by the node's store
    pub memory_usage: u64,
    pub capabilities: BTreeSet<String>,
}

impl ClusterNode {
    pub fn new(id: impl Into<String>, advertised_host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            advertised_host: advertised_host.into(),
            port,
            status: NodeStatus::New,
            last_heartbeat: 0,
            session_count: 0,
            memory_usage: 0,
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.advertised_host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Suspended,
    Terminated,
    /// Only placement metadata survived; content is pending recovery
    Degraded,
}

/// What a client supplies to create a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Assigned by the orchestrator before placement when absent
    #[serde(default)]
    pub id: Option<String>,
    pub session_type: String,
    pub name: String,
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl SessionConfig {
    pub fn new(session_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: None,
            session_type: session_type.into(),
            name: name.into(),
            workspace: String::new(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<SessionStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub session_type: String,
    pub name: String,
    pub workspace: String,
    pub config: serde_json::Value,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn from_config(id: String, config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_type: config.session_type,
            name: config.name,
            workspace: config.workspace,
            config: config.config,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, patch: SessionPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(workspace) = patch.workspace {
            self.workspace = workspace;
        }
        if let Some(config) = patch.config {
            self.config = config;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        // updated_at never goes backwards, replicas compare it
        self.updated_at = Utc::now().max(self.updated_at);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            session_type: self.session_type.clone(),
            name: self.name.clone(),
            workspace: self.workspace.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// The metadata part of a session, kept even when content is unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub session_type: String,
    pub name: String,
    pub workspace: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSummary {
    /// Stand-in session served while content is pending.
    pub fn degraded_session(&self) -> Session {
        Session {
            id: self.id.clone(),
            session_type: self.session_type.clone(),
            name: self.name.clone(),
            workspace: self.workspace.clone(),
            config: serde_json::Value::Null,
            status: SessionStatus::Degraded,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Where a session lives, as last computed by this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPlacement {
    pub session_id: String,
    pub owner: String,
    /// Replica node ids in ring order, owner excluded
    pub replicas: Vec<String>,
    pub under_replicated: bool,
    pub degraded: bool,
    pub summary: SessionSummary,
    pub ring_version: u64,
}

impl SessionPlacement {
    /// Owner first, then replicas.
    pub fn nodes(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.owner).chain(self.replicas.iter())
    }
}
