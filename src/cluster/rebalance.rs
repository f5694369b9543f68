//! Failover rebalancing.
//!
//! Ownership is a function of the ring, so every node reconciles on its own:
//! after each ring change it recomputes the replica set of every session it
//! holds and adopts, follows, or retires its copy accordingly. Only sessions
//! whose replica set actually moved are touched.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cluster::membership::MembershipTable;
use crate::cluster::replication::{ReplicationCoordinator, SessionDirectory};
use crate::cluster::ring::{HashRing, ReplicaSet};
use crate::cluster::transport::{OpReply, SessionOp};
use crate::cluster::types::{Session, SessionPlacement};
use crate::store::LocalSessionStore;

/// Outcome of reconciling one ring change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub from_version: u64,
    pub to_version: u64,
    pub examined: usize,
    pub unchanged: usize,
    /// Sessions this node now owns and holds content for
    pub adopted: usize,
    /// Of those, sessions fetched from another node first
    pub pulled: usize,
    /// Owned sessions nobody could supply content for
    pub degraded: usize,
    pub followed: usize,
    pub marked_stale: usize,
    /// Sessions this node owned and pushed to their new owner
    pub handed_over: usize,
}

#[derive(Debug)]
pub struct FailoverRebalancer {
    node_id: String,
    replication_factor: usize,
    membership: Arc<MembershipTable>,
    replication: Arc<ReplicationCoordinator>,
    store: Arc<dyn LocalSessionStore>,
    directory: Arc<SessionDirectory>,
    applied: ArcSwap<HashRing>,
    run_lock: Mutex<()>,
    /// Copies this node no longer needs, with the time they were retired
    stale: DashMap<String, u64>,
    runs: AtomicU64,
    evicted: AtomicU64,
}

impl FailoverRebalancer {
    pub fn new(
        membership: Arc<MembershipTable>,
        replication: Arc<ReplicationCoordinator>,
        store: Arc<dyn LocalSessionStore>,
    ) -> Self {
        Self {
            node_id: membership.local_id().to_string(),
            replication_factor: replication.replication_factor(),
            applied: ArcSwap::new(membership.ring()),
            directory: replication.directory().clone(),
            membership,
            replication,
            store,
            run_lock: Mutex::new(()),
            stale: DashMap::new(),
            runs: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Ring version the last completed pass reconciled to.
    pub fn applied_version(&self) -> u64 {
        self.applied.load().version()
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn stale_count(&self) -> usize {
        self.stale.len()
    }

    pub fn is_stale(&self, id: &str) -> bool {
        self.stale.contains_key(id)
    }

    /// Reconcile with the current ring if it moved since the last pass.
    pub async fn catch_up(&self) -> Option<RebalanceReport> {
        let _guard = self.run_lock.lock().await;
        let current = self.membership.ring();
        let previous = self.applied.load_full();
        if previous.version() == current.version() {
            return None;
        }

        let report = self.rebalance(&previous, &current).await;
        self.applied.store(current);
        self.runs.fetch_add(1, Ordering::Relaxed);
        info!(
            "Rebalanced ring v{} -> v{}: {} adopted ({} pulled), {} degraded, {} followed, {} stale, {} handed over",
            report.from_version,
            report.to_version,
            report.adopted,
            report.pulled,
            report.degraded,
            report.followed,
            report.marked_stale,
            report.handed_over
        );
        Some(report)
    }

    async fn rebalance(&self, previous: &HashRing, current: &HashRing) -> RebalanceReport {
        let mut report = RebalanceReport {
            from_version: previous.version(),
            to_version: current.version(),
            ..RebalanceReport::default()
        };
        if current.is_empty() {
            debug!("Ring is empty, keeping every local copy in place");
            return report;
        }

        let held: BTreeSet<String> = self
            .store
            .session_ids()
            .into_iter()
            .chain(self.directory.ids())
            .collect();

        for id in held {
            report.examined += 1;
            let before = previous.get_nodes(&id, self.replication_factor);
            let after = current.get_nodes(&id, self.replication_factor);
            if before.nodes == after.nodes {
                report.unchanged += 1;
                continue;
            }

            let was_owner = before.owner() == Some(self.node_id.as_str());
            if was_owner && after.owner() != Some(self.node_id.as_str()) && self.hand_over(&id, current).await {
                report.handed_over += 1;
            }

            if after.owner() == Some(self.node_id.as_str()) {
                self.adopt(&id, &before, &after, current.version(), &mut report).await;
            } else if after.contains(&self.node_id) {
                self.follow(&id, &after, current.version());
                report.followed += 1;
            } else if self.retire(&id) {
                report.marked_stale += 1;
            }
        }
        report
    }

    async fn adopt(
        &self,
        id: &str,
        before: &ReplicaSet,
        after: &ReplicaSet,
        ring_version: u64,
        report: &mut RebalanceReport,
    ) {
        self.stale.remove(id);
        let local = self.store.get_session(id).ok().flatten();
        let session = match local {
            Some(session) => Some(session),
            None => {
                let mut candidates = before.nodes.clone();
                candidates.extend(after.nodes.iter().filter(|n| !before.contains(n)).cloned());
                let pulled = self.replication.pull(id, &candidates).await;
                if pulled.is_some() {
                    report.pulled += 1;
                }
                pulled
            }
        };

        match session {
            Some(session) => match self.replication.adopt(&session).await {
                Ok(_) => report.adopted += 1,
                Err(e) => warn!("Could not adopt session {}: {}", id, e),
            },
            None => {
                warn!("Session {} has no reachable copy, serving metadata only", id);
                if let Some(placement) = self.directory.get(id) {
                    self.directory.record(SessionPlacement {
                        owner: self.node_id.clone(),
                        replicas: after.replicas().to_vec(),
                        under_replicated: after.is_under_replicated(),
                        degraded: true,
                        ring_version,
                        ..placement
                    });
                }
                report.degraded += 1;
            }
        }
    }

    /// Push the local copy of `id` to its placement on `ring`. A new owner
    /// learns of a session only through this push or a later offer.
    async fn hand_over(&self, id: &str, ring: &HashRing) -> bool {
        let session = match self.store.get_session(id) {
            Ok(Some(session)) => session,
            _ => return false,
        };
        let placement = self.placement_on(ring, &session);
        let accepted = self.replication.hand_over(&session, &placement).await;
        if accepted == 0 {
            warn!("Session {} moved to {} but no node took the handover", id, placement.owner);
        }
        accepted > 0
    }

    fn follow(&self, id: &str, after: &ReplicaSet, ring_version: u64) {
        self.stale.remove(id);
        if let Some(placement) = self.directory.get(id) {
            self.directory.record(SessionPlacement {
                owner: after.owner().unwrap_or_default().to_string(),
                replicas: after.replicas().to_vec(),
                under_replicated: after.is_under_replicated(),
                ring_version,
                ..placement
            });
        }
    }

    /// Returns true when a local copy was newly marked stale.
    fn retire(&self, id: &str) -> bool {
        self.directory.remove(id);
        match self.store.get_session(id) {
            Ok(Some(_)) => {
                let now = self.membership.now_millis();
                let fresh = !self.stale.contains_key(id);
                self.stale.entry(id.to_string()).or_insert(now);
                fresh
            }
            _ => false,
        }
    }

    fn placement_on(&self, ring: &HashRing, session: &Session) -> SessionPlacement {
        let set = ring.get_nodes(&session.id, self.replication_factor);
        SessionPlacement {
            session_id: session.id.clone(),
            owner: set.owner().unwrap_or_default().to_string(),
            replicas: set.replicas().to_vec(),
            under_replicated: set.is_under_replicated(),
            degraded: false,
            summary: session.summary(),
            ring_version: ring.version(),
        }
    }

    /// Offer stale copies to their owner and evict the ones the owner holds
    /// once `grace` has passed since they went stale.
    pub async fn reclaim_stale(&self, grace: Duration) -> usize {
        let ring = self.membership.ring();
        let now = self.membership.now_millis();
        let grace_ms = grace.as_millis() as u64;
        let mut evicted = 0;

        let entries: Vec<(String, u64)> = self.stale.iter().map(|e| (e.key().clone(), *e.value())).collect();
        for (id, since) in entries {
            let set = ring.get_nodes(&id, self.replication_factor);
            if set.contains(&self.node_id) {
                self.stale.remove(&id);
                continue;
            }
            let session = match self.store.get_session(&id) {
                Ok(Some(session)) => session,
                _ => {
                    self.stale.remove(&id);
                    continue;
                }
            };
            let owner = match set.owner() {
                Some(owner) => owner.to_string(),
                None => continue,
            };

            let op = SessionOp::Offer {
                placement: self.placement_on(&ring, &session),
                session,
            };
            match self.replication.send_op(&owner, op, self.membership.settings().retry).await {
                Ok(OpReply::Stored(true)) if now.saturating_sub(since) >= grace_ms => {
                    match self.store.delete_session(&id) {
                        Ok(_) => {
                            self.stale.remove(&id);
                            evicted += 1;
                            debug!("Evicted stale copy of {} held by {}", id, owner);
                        }
                        Err(e) => warn!("Could not evict stale copy of {}: {}", id, e),
                    }
                }
                Ok(OpReply::Stored(true)) => {}
                Ok(OpReply::Deleted(_)) => match self.store.delete_session(&id) {
                    Ok(_) => {
                        self.stale.remove(&id);
                        evicted += 1;
                        debug!("Dropped stale copy of deleted session {}", id);
                    }
                    Err(e) => warn!("Could not drop stale copy of {}: {}", id, e),
                },
                Ok(other) => debug!("Owner {} declined stale copy of {}: {:?}", owner, id, other),
                Err(e) => debug!("Offer of {} to {} failed: {}", id, owner, e),
            }
        }

        self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Push every local session to the nodes that will own it once this node
    /// has left. Returns the number of sessions at least one node accepted.
    pub async fn handoff_owned(&self) -> usize {
        let ring = self.membership.ring();
        let without = if ring.contains(&self.node_id) {
            match ring.remove_node(&self.node_id) {
                Ok(ring) => ring,
                Err(_) => return 0,
            }
        } else {
            (*ring).clone()
        };
        if without.is_empty() {
            warn!("No other healthy node to hand sessions off to");
            return 0;
        }

        let _guard = self.run_lock.lock().await;
        let mut handed = 0;
        for id in self.store.session_ids() {
            let session = match self.store.get_session(&id) {
                Ok(Some(session)) => session,
                _ => continue,
            };
            let placement = self.placement_on(&without, &session);
            if self.replication.hand_over(&session, &placement).await > 0 {
                handed += 1;
            } else {
                warn!("Handoff of session {} reached no node", id);
            }
        }
        info!("Handed off {} sessions before leaving", handed);
        handed
    }
}
