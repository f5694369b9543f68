use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Errors surfaced by the cluster coordination layer.
///
/// Every variant carries owned, serialisable data so an error raised by a
/// remote node's store can travel back inside a forwarded-operation reply and
/// reach the caller unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestratorError {
    /// The ring has no healthy nodes to place a key on
    #[error("No available nodes in the hash ring")]
    NoAvailableNodes,

    /// Fewer healthy nodes than the replication factor (warning, never fatal)
    #[error("Under-replicated: {available} of {required} replicas available")]
    UnderReplicated { available: usize, required: usize },

    #[error("Owner unreachable: {0}")]
    OwnerUnreachable(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Node already exists: {0}")]
    NodeAlreadyExists(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Session store is full ({0} sessions)")]
    CapacityExceeded(usize),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("YAML error: {0}")]
    Yaml(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn store(msg: impl Into<String>) -> Self {
        OrchestratorError::Store(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        OrchestratorError::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        OrchestratorError::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        OrchestratorError::Config(msg.into())
    }

    /// Whether a retry against the same node could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Transport(_) | OrchestratorError::Timeout(_)
        )
    }
}

impl From<io::Error> for OrchestratorError {
    fn from(e: io::Error) -> Self {
        OrchestratorError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(e: serde_yaml::Error) -> Self {
        OrchestratorError::Yaml(e.to_string())
    }
}
