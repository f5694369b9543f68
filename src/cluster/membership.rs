//! Cluster Membership
//!
//! Tracks every known node and its health:
//! - NEW → HEALTHY → SUSPECT → DEAD → REMOVED, driven by heartbeat silence
//! - Last-write-wins merge of gossip on each node's `last_heartbeat`
//! - Push-pull gossip to a random subset of peers, heartbeats to all peers
//! - The hash ring, kept equal to the set of HEALTHY nodes
//!
//! Both the membership view and the ring are immutable snapshots. Writers
//! serialise on one lock, build the next snapshot and swap it in; readers
//! load a snapshot once and never block.

use arc_swap::ArcSwap;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cluster::clock::Clock;
use crate::cluster::ring::{HashRing, SharedRing};
use crate::cluster::transport::{Ack, Envelope, MessagePayload, RetryPolicy, Transport};
use crate::cluster::types::{ClusterNode, NodeStatus};
use crate::config::ClusterConfig;
use crate::error::{OrchestratorError, Result};

/// Timing and fan-out knobs of the membership protocol.
#[derive(Debug, Clone)]
pub struct MembershipSettings {
    pub virtual_nodes: usize,
    pub suspect_after: Duration,
    pub dead_after: Duration,
    pub tombstone_ttl: Duration,
    pub gossip_fanout: usize,
    pub retry: RetryPolicy,
}

impl From<&ClusterConfig> for MembershipSettings {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            virtual_nodes: config.virtual_nodes,
            suspect_after: config.suspect_after(),
            dead_after: config.heartbeat_timeout(),
            tombstone_ttl: config.tombstone_ttl(),
            gossip_fanout: config.gossip_fanout,
            retry: RetryPolicy::new(config.max_retries, config.retry_backoff(), config.request_timeout()),
        }
    }
}

/// One published version of the membership view.
#[derive(Debug, Clone, Default)]
pub struct MembershipSnapshot {
    pub version: u64,
    pub nodes: BTreeMap<String, ClusterNode>,
}

impl MembershipSnapshot {
    pub fn get(&self, id: &str) -> Option<&ClusterNode> {
        self.nodes.get(id)
    }

    /// Nodes that are still part of the cluster (tombstones excluded).
    pub fn members(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values().filter(|n| n.status.is_member())
    }

    pub fn healthy_ids(&self) -> BTreeSet<String> {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Healthy)
            .map(|n| n.id.clone())
            .collect()
    }
}

/// Emitted whenever the ring is swapped.
#[derive(Debug, Clone)]
pub struct RingChange {
    pub previous: Arc<HashRing>,
    pub current: Arc<HashRing>,
}

/// What one cleanup pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub suspected: Vec<String>,
    pub dead: Vec<String>,
    pub removed: Vec<String>,
    pub purged: Vec<String>,
    pub ring_changed: bool,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.suspected.is_empty() && self.dead.is_empty() && self.removed.is_empty() && self.purged.is_empty()
    }
}

pub struct MembershipTable {
    local_id: String,
    local_addr: String,
    settings: MembershipSettings,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    view: ArcSwap<MembershipSnapshot>,
    ring: SharedRing,
    write_lock: Mutex<()>,
    changes: broadcast::Sender<RingChange>,
}

impl std::fmt::Debug for MembershipTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.view.load();
        f.debug_struct("MembershipTable")
            .field("local_id", &self.local_id)
            .field("version", &view.version)
            .field("nodes", &view.nodes.len())
            .field("ring_version", &self.ring.load().version())
            .finish()
    }
}

impl MembershipTable {
    pub fn new(config: &ClusterConfig, clock: Arc<dyn Clock>, transport: Arc<dyn Transport>) -> Self {
        let mut capabilities: BTreeSet<String> = config.capabilities.iter().cloned().collect();
        capabilities.insert(format!("cpus:{}", num_cpus::get()));

        let mut local = ClusterNode::new(&config.node_id, &config.advertised_host, config.port);
        local.capabilities = capabilities;

        Self::with_local_node(local, MembershipSettings::from(config), clock, transport)
    }

    pub fn with_local_node(
        local: ClusterNode,
        settings: MembershipSettings,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (changes, _) = broadcast::channel(64);
        let local_id = local.id.clone();
        let local_addr = local.address();
        let mut nodes = BTreeMap::new();
        nodes.insert(local_id.clone(), local);

        Self {
            local_id,
            local_addr,
            ring: SharedRing::new(HashRing::new(settings.virtual_nodes)),
            settings,
            clock,
            transport,
            view: ArcSwap::from_pointee(MembershipSnapshot { version: 0, nodes }),
            write_lock: Mutex::new(()),
            changes,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn settings(&self) -> &MembershipSettings {
        &self.settings
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.view.load_full()
    }

    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.load()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RingChange> {
        self.changes.subscribe()
    }

    pub fn node(&self, id: &str) -> Option<ClusterNode> {
        self.view.load().get(id).cloned()
    }

    pub fn local_node(&self) -> ClusterNode {
        // The local entry is inserted at construction and never purged.
        self.node(&self.local_id)
            .unwrap_or_else(|| ClusterNode::new(&self.local_id, "", 0))
    }

    pub fn nodes(&self) -> Vec<ClusterNode> {
        self.view.load().nodes.values().cloned().collect()
    }

    pub fn address_of(&self, id: &str) -> Option<String> {
        self.view.load().get(id).map(ClusterNode::address)
    }

    pub fn healthy_count(&self) -> usize {
        self.view.load().nodes.values().filter(|n| n.status == NodeStatus::Healthy).count()
    }

    fn classify(&self, elapsed_ms: u64) -> NodeStatus {
        if elapsed_ms >= self.settings.dead_after.as_millis() as u64 {
            NodeStatus::Dead
        } else if elapsed_ms >= self.settings.suspect_after.as_millis() as u64 {
            NodeStatus::Suspect
        } else {
            NodeStatus::Healthy
        }
    }

    /// Apply `f` to a copy of the view, publish it, and realign the ring.
    fn mutate<R>(&self, f: impl FnOnce(&mut BTreeMap<String, ClusterNode>, u64) -> R) -> (R, Option<RingChange>) {
        let _guard = self.write_lock.lock();
        let current = self.view.load_full();
        let mut nodes = current.nodes.clone();
        let result = f(&mut nodes, self.clock.now_millis());

        if nodes == current.nodes {
            return (result, None);
        }

        let next = MembershipSnapshot {
            version: current.version + 1,
            nodes,
        };
        let healthy = next.healthy_ids();
        self.view.store(Arc::new(next));
        (result, self.reconcile_ring(&healthy))
    }

    fn reconcile_ring(&self, healthy: &BTreeSet<String>) -> Option<RingChange> {
        let previous = self.ring.load();
        if previous.node_ids() == healthy {
            return None;
        }

        let mut next = (*previous).clone();
        for gone in previous.node_ids().difference(healthy) {
            if let Ok(ring) = next.remove_node(gone) {
                next = ring;
            }
        }
        for joined in healthy.difference(previous.node_ids()) {
            if let Ok(ring) = next.add_node(joined) {
                next = ring;
            }
        }

        info!(
            "Ring v{} -> v{}: {} healthy nodes",
            previous.version(),
            next.version(),
            next.len()
        );
        let previous = self.ring.swap(next);
        let change = RingChange {
            previous,
            current: self.ring.load(),
        };
        // No subscribers is fine.
        let _ = self.changes.send(change.clone());
        Some(change)
    }

    /// Fold one incoming record into `nodes`. `direct` means the record came
    /// from the node itself.
    fn absorb(&self, nodes: &mut BTreeMap<String, ClusterNode>, incoming: ClusterNode, direct: bool, now: u64) {
        if incoming.id == self.local_id {
            return;
        }

        let fresh_status = |elapsed: u64| {
            if direct {
                NodeStatus::Healthy
            } else if incoming.last_heartbeat == 0 {
                NodeStatus::New
            } else {
                self.classify(elapsed)
            }
        };
        let elapsed = now.saturating_sub(incoming.last_heartbeat);

        match nodes.get(&incoming.id) {
            None => {
                if incoming.status == NodeStatus::Removed {
                    return;
                }
                let status = fresh_status(elapsed);
                info!("Discovered node {} at {} ({})", incoming.id, incoming.address(), status);
                nodes.insert(incoming.id.clone(), ClusterNode { status, ..incoming });
            }
            Some(existing) if incoming.last_heartbeat <= existing.last_heartbeat => {}
            Some(existing) if existing.status == NodeStatus::Removed => {
                if direct {
                    info!("Node {} rejoined after removal", incoming.id);
                    nodes.insert(
                        incoming.id.clone(),
                        ClusterNode {
                            status: NodeStatus::Healthy,
                            ..incoming
                        },
                    );
                }
            }
            Some(existing) => {
                let observed = fresh_status(elapsed);
                let status = if observed == NodeStatus::Healthy {
                    NodeStatus::Healthy
                } else {
                    observed.max(existing.status)
                };
                if status != existing.status {
                    info!("Node {} {} -> {}", incoming.id, existing.status, status);
                }
                nodes.insert(incoming.id.clone(), ClusterNode { status, ..incoming });
            }
        }
    }

    /// Last-write-wins merge of a membership delta.
    pub fn merge(&self, entries: Vec<ClusterNode>, sender: Option<&str>) -> Option<RingChange> {
        let (_, change) = self.mutate(|nodes, now| {
            for entry in entries {
                let direct = sender == Some(entry.id.as_str());
                self.absorb(nodes, entry, direct, now);
            }
        });
        change
    }

    /// A heartbeat straight from `node`.
    pub fn record_heartbeat(&self, node: ClusterNode) -> Option<RingChange> {
        let (_, change) = self.mutate(|nodes, now| self.absorb(nodes, node, true, now));
        change
    }

    /// Stamp a fresh local heartbeat and publish the local load figures.
    ///
    /// The timestamp is strictly increasing even if the clock stalls, so every
    /// heartbeat wins the last-write-wins merge at its receivers.
    pub fn touch_local(&self, session_count: usize, memory_usage: u64) -> (ClusterNode, Option<RingChange>) {
        let local_id = self.local_id.clone();
        self.mutate(|nodes, now| {
            let local = nodes
                .entry(local_id.clone())
                .or_insert_with(|| ClusterNode::new(&local_id, "", 0));
            local.last_heartbeat = now.max(local.last_heartbeat + 1);
            local.status = NodeStatus::Healthy;
            local.session_count = session_count;
            local.memory_usage = memory_usage;
            local.clone()
        })
    }

    /// Administrative insert of a node record as given.
    pub fn add_node(&self, node: ClusterNode) -> Result<Option<RingChange>> {
        let (result, change) = self.mutate(|nodes, _| match nodes.get(&node.id) {
            Some(existing) if existing.status.is_member() => {
                Err(OrchestratorError::NodeAlreadyExists(node.id.clone()))
            }
            _ => {
                info!("Added node {} at {} ({})", node.id, node.address(), node.status);
                nodes.insert(node.id.clone(), node);
                Ok(())
            }
        });
        result.map(|_| change)
    }

    /// Administrative removal: the node is marked DEAD and leaves the ring;
    /// the next cleanup pass turns it into a REMOVED tombstone.
    pub fn remove_node(&self, id: &str) -> Result<Option<RingChange>> {
        if id == self.local_id {
            return Err(OrchestratorError::config("Cannot remove the local node"));
        }
        let (result, change) = self.mutate(|nodes, _| match nodes.get_mut(id) {
            Some(node) if node.status.is_member() => {
                info!("Marking node {} dead on request", id);
                node.status = NodeStatus::Dead;
                Ok(())
            }
            _ => Err(OrchestratorError::NodeNotFound(id.to_string())),
        });
        result.map(|_| change)
    }

    /// Advance every remote node's status by its heartbeat silence.
    ///
    /// Nodes found DEAD at the start of the pass become REMOVED, so removal
    /// always takes a later pass than the one that declared the node dead.
    pub fn cleanup_dead_nodes(&self) -> SweepReport {
        let dead_ms = self.settings.dead_after.as_millis() as u64;
        let purge_ms = dead_ms + self.settings.tombstone_ttl.as_millis() as u64;

        let (mut report, change) = self.mutate(|nodes, now| {
            let mut report = SweepReport::default();
            let mut purged = Vec::new();

            for node in nodes.values_mut().filter(|n| n.id != self.local_id) {
                let elapsed = now.saturating_sub(node.last_heartbeat);
                match node.status {
                    // Never heard from; nothing to time out against
                    NodeStatus::New if node.last_heartbeat == 0 => {}
                    NodeStatus::New | NodeStatus::Healthy | NodeStatus::Suspect => {
                        let observed = self.classify(elapsed);
                        if observed > node.status {
                            match observed {
                                NodeStatus::Suspect => report.suspected.push(node.id.clone()),
                                NodeStatus::Dead => report.dead.push(node.id.clone()),
                                _ => {}
                            }
                            warn!("Node {} {} -> {} after {}ms of silence", node.id, node.status, observed, elapsed);
                            node.status = observed;
                        }
                    }
                    NodeStatus::Dead => {
                        info!("Removing dead node {}", node.id);
                        node.status = NodeStatus::Removed;
                        report.removed.push(node.id.clone());
                    }
                    NodeStatus::Removed => {
                        if elapsed >= purge_ms {
                            purged.push(node.id.clone());
                        }
                    }
                }
            }

            for id in purged {
                debug!("Purging tombstone for node {}", id);
                nodes.remove(&id);
                report.purged.push(id);
            }
            report
        });

        report.ring_changed = change.is_some();
        report
    }

    /// Records to disseminate: everything except tombstones.
    pub fn gossip_view(&self) -> Vec<ClusterNode> {
        self.view.load().members().cloned().collect()
    }

    fn peers(&self) -> Vec<ClusterNode> {
        self.view
            .load()
            .members()
            .filter(|n| n.id != self.local_id)
            .cloned()
            .collect()
    }

    fn envelope(&self, payload: MessagePayload) -> Envelope {
        Envelope::new(&self.local_id, &self.local_addr, payload, self.clock.now_millis())
    }

    /// Exchange views with one address and merge the reply.
    async fn exchange(&self, addr: &str, policy: RetryPolicy) -> Result<()> {
        let envelope = self.envelope(MessagePayload::Gossip(self.gossip_view()));
        let reply = policy.send(self.transport.as_ref(), addr, envelope).await?;
        let responder = reply.source.clone();
        match reply.into_ack()? {
            Ack::Members(members) => {
                self.merge(members, Some(&responder));
                Ok(())
            }
            other => Err(OrchestratorError::protocol(format!("Unexpected gossip ack {:?}", other))),
        }
    }

    /// Contact each seed and merge its view. Unreachable seeds are skipped;
    /// a node with no reachable seed starts a cluster of its own.
    pub async fn join(&self, seeds: &[String]) -> usize {
        let mut contacted = 0;
        for seed in seeds.iter().filter(|s| **s != self.local_addr) {
            match self.exchange(seed, self.settings.retry).await {
                Ok(()) => {
                    contacted += 1;
                    info!("Joined via seed {}", seed);
                }
                Err(e) => warn!("Seed {} unreachable: {}", seed, e),
            }
        }
        if contacted == 0 && !seeds.is_empty() {
            warn!("No seed reachable, starting as a single-node cluster");
        }
        contacted
    }

    /// Push-pull gossip with a random subset of peers.
    pub async fn gossip_round(&self) -> usize {
        let mut peers = self.peers();
        {
            let mut rng = rand::rng();
            peers.shuffle(&mut rng);
        }
        peers.truncate(self.settings.gossip_fanout);

        let policy = RetryPolicy::once(self.settings.retry.timeout);
        let results = join_all(peers.iter().map(|peer| async move {
            let addr = peer.address();
            match self.exchange(&addr, policy).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("Gossip to {} failed: {}", peer.id, e);
                    false
                }
            }
        }))
        .await;
        results.into_iter().filter(|ok| *ok).count()
    }

    /// Stamp a local heartbeat and send it to every peer.
    pub async fn heartbeat_round(&self, session_count: usize, memory_usage: u64) -> usize {
        let (local, _) = self.touch_local(session_count, memory_usage);
        let policy = RetryPolicy::once(self.settings.retry.timeout);
        let peers = self.peers();

        let results = join_all(peers.iter().map(|peer| {
            let envelope = self.envelope(MessagePayload::Heartbeat(local.clone()));
            async move {
                match policy.send(self.transport.as_ref(), &peer.address(), envelope).await {
                    Ok(_) => true,
                    Err(e) => {
                        debug!("Heartbeat to {} failed: {}", peer.id, e);
                        false
                    }
                }
            }
        }))
        .await;
        results.into_iter().filter(|ok| *ok).count()
    }

    /// Handle a heartbeat or gossip message and produce the ack.
    pub fn handle_incoming_message(&self, envelope: Envelope) -> Result<Ack> {
        match envelope.payload {
            MessagePayload::Heartbeat(node) => {
                if node.id != envelope.source {
                    return Err(OrchestratorError::protocol(format!(
                        "Heartbeat for {} sent by {}",
                        node.id, envelope.source
                    )));
                }
                self.record_heartbeat(node);
                Ok(Ack::Empty)
            }
            MessagePayload::Gossip(members) => {
                self.merge(members, Some(&envelope.source));
                Ok(Ack::Members(self.gossip_view()))
            }
            other => Err(OrchestratorError::protocol(format!(
                "Membership cannot handle {:?}",
                other.kind()
            ))),
        }
    }
}
