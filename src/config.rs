use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Per-node cluster configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default = "default_advertised_host")]
    pub advertised_host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Seed peers as `host:port`
    #[serde(default)]
    pub seeds: Vec<String>,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Ring tokens per physical node
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    /// Missed gossip intervals before a node becomes suspect
    #[serde(default = "default_suspect_miss_threshold")]
    pub suspect_miss_threshold: u32,

    /// Peers contacted per gossip round
    #[serde(default = "default_gossip_fanout")]
    pub gossip_fanout: usize,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long a copy this node no longer owns is kept after the owner has it
    #[serde(default = "default_stale_grace_ms")]
    pub stale_grace_ms: u64,

    /// How long a REMOVED node is remembered before it is purged
    #[serde(default = "default_tombstone_ttl_ms")]
    pub tombstone_ttl_ms: u64,

    #[serde(default = "default_handoff_on_shutdown")]
    pub handoff_on_shutdown: bool,

    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_advertised_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7946
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_replication_factor() -> usize {
    2
}

fn default_gossip_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_timeout_ms() -> u64 {
    5000
}

fn default_sync_interval_ms() -> u64 {
    10_000
}

fn default_virtual_nodes() -> usize {
    128
}

fn default_suspect_miss_threshold() -> u32 {
    3
}

fn default_gossip_fanout() -> usize {
    3
}

fn default_request_timeout_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    20
}

fn default_stale_grace_ms() -> u64 {
    30_000
}

fn default_tombstone_ttl_ms() -> u64 {
    60_000
}

fn default_handoff_on_shutdown() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            advertised_host: default_advertised_host(),
            port: default_port(),
            seeds: Vec::new(),
            max_sessions: default_max_sessions(),
            replication_factor: default_replication_factor(),
            gossip_interval_ms: default_gossip_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            virtual_nodes: default_virtual_nodes(),
            suspect_miss_threshold: default_suspect_miss_threshold(),
            gossip_fanout: default_gossip_fanout(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            stale_grace_ms: default_stale_grace_ms(),
            tombstone_ttl_ms: default_tombstone_ttl_ms(),
            handoff_on_shutdown: default_handoff_on_shutdown(),
            capabilities: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

impl ClusterConfig {
    /// Configuration for a node with the given identity, everything else default.
    pub fn for_node(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            advertised_host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());
        let content = fs::read_to_string(path)?;
        let config: ClusterConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        debug!("Saving configuration to {}", path.display());
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Address peers use to reach this node.
    pub fn address(&self) -> String {
        format!("{}:{}", self.advertised_host, self.port)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Heartbeats go out three times per timeout window.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.heartbeat_timeout_ms / 3).max(1))
    }

    pub fn suspect_after(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms * u64::from(self.suspect_miss_threshold))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn stale_grace(&self) -> Duration {
        Duration::from_millis(self.stale_grace_ms)
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_millis(self.tombstone_ttl_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(OrchestratorError::config("Node id cannot be empty"));
        }

        if self.port == 0 {
            return Err(OrchestratorError::config("Port cannot be zero"));
        }

        for seed in &self.seeds {
            validate_seed(seed)?;
        }

        if self.max_sessions == 0 {
            return Err(OrchestratorError::config("Max sessions cannot be zero"));
        }

        if self.replication_factor == 0 {
            return Err(OrchestratorError::config("Replication factor cannot be zero"));
        }

        if self.virtual_nodes == 0 {
            return Err(OrchestratorError::config("Virtual node count cannot be zero"));
        }

        if self.gossip_interval_ms == 0
            || self.heartbeat_timeout_ms == 0
            || self.sync_interval_ms == 0
            || self.request_timeout_ms == 0
        {
            return Err(OrchestratorError::config("Intervals and timeouts cannot be zero"));
        }

        if self.suspect_miss_threshold == 0 {
            return Err(OrchestratorError::config("Suspect miss threshold cannot be zero"));
        }

        if self.suspect_after() >= self.heartbeat_timeout() {
            return Err(OrchestratorError::config(
                "Heartbeat timeout must be greater than gossip interval times suspect miss threshold",
            ));
        }

        if self.gossip_fanout == 0 {
            return Err(OrchestratorError::config("Gossip fan-out cannot be zero"));
        }

        match self.log_level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            _ => Err(OrchestratorError::config("Invalid log level")),
        }
    }
}

fn validate_seed(seed: &str) -> Result<()> {
    match seed.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().map_or(false, |p| p != 0) => Ok(()),
        _ => Err(OrchestratorError::config(format!(
            "Invalid seed address '{}', expected host:port",
            seed
        ))),
    }
}
