//! Command-line interface for nexa-orchestrator
//!
//! Provides:
//! - An in-process cluster simulation with node failures
//! - Writing and validating cluster configuration files

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

use crate::cluster::{ClusterMetrics, ClusterOrchestrator, LocalNetwork, SessionConfig};
use crate::config::ClusterConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Also write JSON logs into this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an in-process cluster, kill some nodes and print the metrics
    Simulate(SimulateArgs),
    /// Write a default configuration file
    InitConfig {
        /// Defaults to the user configuration directory
        path: Option<PathBuf>,
    },
    /// Load and validate a configuration file
    CheckConfig { path: PathBuf },
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    #[arg(long, default_value_t = 3)]
    pub nodes: usize,

    #[arg(long, default_value_t = 100)]
    pub sessions: usize,

    /// Nodes to crash after the sessions are created
    #[arg(long, default_value_t = 1)]
    pub kill: usize,

    #[arg(long, default_value_t = 2)]
    pub replication_factor: usize,

    #[arg(long, default_value_t = 7100)]
    pub base_port: u16,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub nodes: usize,
    pub sessions: usize,
    pub killed: Vec<String>,
    pub average_create_micros: f64,
    /// Sessions still readable from a survivor after the failures
    pub retrievable: usize,
    pub metrics: ClusterMetrics,
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("nexa-orchestrator").join("cluster.yaml"))
        .unwrap_or_else(|| PathBuf::from("cluster.yaml"))
}

/// Build a cluster on a [`LocalNetwork`], load it, crash `kill` nodes and let
/// the survivors reconcile.
pub async fn simulate(args: &SimulateArgs) -> anyhow::Result<SimulationReport> {
    if args.nodes == 0 {
        bail!("A simulation needs at least one node");
    }
    if args.kill >= args.nodes {
        bail!("Cannot kill {} of {} nodes, one must survive", args.kill, args.nodes);
    }

    let network = LocalNetwork::new();
    let mut nodes: Vec<ClusterOrchestrator> = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let port = args
            .base_port
            .checked_add(i as u16)
            .context("Port range overflows")?;
        let mut config = ClusterConfig::for_node(format!("node-{}", i), "127.0.0.1", port);
        config.replication_factor = args.replication_factor;
        config.max_sessions = args.sessions.max(1) * args.replication_factor.max(1);
        if let Some(first) = nodes.first() {
            config.seeds = vec![first.address().to_string()];
        }

        let node = ClusterOrchestrator::in_memory(config, network.clone())?;
        node.start().await?;
        nodes.push(node);
    }

    // Spread the full view to every node before placing sessions.
    for _ in 0..2 {
        for node in &nodes {
            node.gossip_round().await;
        }
    }

    let started = Instant::now();
    let mut ids = Vec::with_capacity(args.sessions);
    for i in 0..args.sessions {
        let node = &nodes[i % nodes.len()];
        let session = node
            .create_session(SessionConfig::new("agent", format!("sim-{}", i)))
            .await?;
        ids.push(session.id);
    }
    let average_create_micros = if args.sessions == 0 {
        0.0
    } else {
        started.elapsed().as_micros() as f64 / args.sessions as f64
    };

    for node in &nodes {
        node.heartbeat_round().await;
    }

    let survivors = nodes.split_off(args.kill);
    let mut killed = Vec::with_capacity(nodes.len());
    for node in nodes {
        node.halt().await;
        killed.push(node.node_id().to_string());
    }
    for survivor in &survivors {
        for id in &killed {
            if let Err(e) = survivor.remove_node(id).await {
                warn!("{} could not remove {}: {}", survivor.node_id(), id, e);
            }
        }
        survivor.cleanup_dead_nodes().await;
    }
    for survivor in &survivors {
        survivor.heartbeat_round().await;
    }

    let observer = &survivors[0];
    let mut retrievable = 0;
    for id in &ids {
        if observer.get_session(id).await?.is_some() {
            retrievable += 1;
        }
    }
    let metrics = observer.get_cluster_metrics();

    for survivor in &survivors {
        survivor.halt().await;
    }

    Ok(SimulationReport {
        nodes: args.nodes,
        sessions: args.sessions,
        killed,
        average_create_micros,
        retrievable,
        metrics,
    })
}

pub struct CliHandler;

impl Default for CliHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl CliHandler {
    pub fn new() -> Self {
        Self
    }

    pub async fn handle(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Simulate(args) => {
                info!(
                    "Simulating {} nodes, {} sessions, {} failures",
                    args.nodes, args.sessions, args.kill
                );
                let report = simulate(&args).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Commands::InitConfig { path } => {
                let path = path.unwrap_or_else(default_config_path);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                ClusterConfig::default().save(&path)?;
                println!("Wrote default configuration to {}", path.display());
            }
            Commands::CheckConfig { path } => {
                let config = ClusterConfig::load(&path)
                    .with_context(|| format!("Invalid configuration in {}", path.display()))?;
                println!(
                    "{} is valid: node {} at {}, replication factor {}, {} seeds",
                    path.display(),
                    config.node_id,
                    config.address(),
                    config.replication_factor,
                    config.seeds.len()
                );
            }
        }
        Ok(())
    }
}
