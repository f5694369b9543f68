pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod logging;
pub mod store;

// Re-export common types
pub use cluster::{ClusterMetrics, ClusterOrchestrator, HashRing, LocalNetwork, MembershipTable};
pub use config::ClusterConfig;
pub use error::{OrchestratorError, Result};
pub use store::{InMemorySessionStore, LocalSessionStore};
