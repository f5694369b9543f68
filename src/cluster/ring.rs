//! Consistent hash ring with virtual nodes.
//!
//! A [`HashRing`] is an immutable snapshot: adding or removing a node builds a
//! new ring with a bumped version. [`SharedRing`] publishes the current
//! snapshot through an atomic pointer swap so lookups never see a ring that is
//! half built.

use arc_swap::ArcSwap;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{OrchestratorError, Result};

/// One position on the ring.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RingToken {
    pub hash: u64,
    pub node_id: String,
}

/// Hash used for both keys and tokens: the first eight bytes of SHA-256.
pub fn hash_key(key: &[u8]) -> u64 {
    let digest = Sha256::digest(key);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn node_tokens(node_id: &str, virtual_nodes: usize) -> Vec<RingToken> {
    (0..virtual_nodes)
        .map(|i| RingToken {
            hash: hash_key(format!("{}#{}", node_id, i).as_bytes()),
            node_id: node_id.to_string(),
        })
        .collect()
}

/// Ordered, distinct nodes responsible for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSet {
    pub nodes: Vec<String>,
    pub requested: usize,
}

impl ReplicaSet {
    pub fn owner(&self) -> Option<&str> {
        self.nodes.first().map(String::as_str)
    }

    pub fn replicas(&self) -> &[String] {
        self.nodes.get(1..).unwrap_or(&[])
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.iter().any(|n| n == node_id)
    }

    pub fn is_under_replicated(&self) -> bool {
        self.nodes.len() < self.requested
    }

    /// The warning to report when fewer distinct nodes exist than requested.
    pub fn under_replication(&self) -> Option<OrchestratorError> {
        self.is_under_replicated().then(|| OrchestratorError::UnderReplicated {
            available: self.nodes.len(),
            required: self.requested,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HashRing {
    tokens: Vec<RingToken>,
    nodes: BTreeSet<String>,
    virtual_nodes: usize,
    version: u64,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            tokens: Vec::new(),
            nodes: BTreeSet::new(),
            virtual_nodes: virtual_nodes.max(1),
            version: 0,
        }
    }

    /// Build a ring holding the given nodes.
    pub fn with_nodes<I, S>(virtual_nodes: usize, node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ring = Self::new(virtual_nodes);
        for id in node_ids {
            let id = id.into();
            if ring.nodes.insert(id.clone()) {
                ring.tokens.extend(node_tokens(&id, ring.virtual_nodes));
            }
        }
        ring.tokens.sort_unstable();
        ring
    }

    /// New snapshot with `node_id`'s tokens merged in.
    pub fn add_node(&self, node_id: &str) -> Result<HashRing> {
        if self.nodes.contains(node_id) {
            return Err(OrchestratorError::NodeAlreadyExists(node_id.to_string()));
        }

        let mut added = node_tokens(node_id, self.virtual_nodes);
        added.sort_unstable();

        // Both sides are sorted, so a linear merge keeps the order.
        let mut tokens = Vec::with_capacity(self.tokens.len() + added.len());
        let (mut left, mut right) = (self.tokens.iter().peekable(), added.into_iter().peekable());
        loop {
            let take_left = match (left.peek(), right.peek()) {
                (Some(l), Some(r)) => *l <= r,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            if take_left {
                tokens.extend(left.next().cloned());
            } else {
                tokens.extend(right.next());
            }
        }

        let mut nodes = self.nodes.clone();
        nodes.insert(node_id.to_string());
        Ok(HashRing {
            tokens,
            nodes,
            virtual_nodes: self.virtual_nodes,
            version: self.version + 1,
        })
    }

    /// New snapshot without any of `node_id`'s tokens.
    pub fn remove_node(&self, node_id: &str) -> Result<HashRing> {
        if !self.nodes.contains(node_id) {
            return Err(OrchestratorError::NodeNotFound(node_id.to_string()));
        }

        let mut nodes = self.nodes.clone();
        nodes.remove(node_id);
        Ok(HashRing {
            tokens: self
                .tokens
                .iter()
                .filter(|t| t.node_id != node_id)
                .cloned()
                .collect(),
            nodes,
            virtual_nodes: self.virtual_nodes,
            version: self.version + 1,
        })
    }

    /// First token at or after the key's hash, wrapping around.
    fn start_index(&self, key: &str) -> usize {
        let hash = hash_key(key.as_bytes());
        let idx = self.tokens.partition_point(|t| t.hash < hash);
        if idx == self.tokens.len() {
            0
        } else {
            idx
        }
    }

    pub fn get_node(&self, key: &str) -> Result<&str> {
        if self.tokens.is_empty() {
            return Err(OrchestratorError::NoAvailableNodes);
        }
        Ok(&self.tokens[self.start_index(key)].node_id)
    }

    /// Up to `n` distinct nodes, walking clockwise from the key.
    pub fn get_nodes(&self, key: &str, n: usize) -> ReplicaSet {
        let wanted = n.min(self.nodes.len());
        let mut nodes: Vec<String> = Vec::with_capacity(wanted);

        if wanted > 0 {
            let start = self.start_index(key);
            for offset in 0..self.tokens.len() {
                let token = &self.tokens[(start + offset) % self.tokens.len()];
                if !nodes.iter().any(|existing| *existing == token.node_id) {
                    nodes.push(token.node_id.clone());
                    if nodes.len() == wanted {
                        break;
                    }
                }
            }
        }

        ReplicaSet { nodes, requested: n }
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    pub fn node_ids(&self) -> &BTreeSet<String> {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn tokens(&self) -> &[RingToken] {
        &self.tokens
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// The live ring, swapped atomically as membership changes.
#[derive(Debug)]
pub struct SharedRing {
    current: ArcSwap<HashRing>,
}

impl SharedRing {
    pub fn new(ring: HashRing) -> Self {
        Self {
            current: ArcSwap::from_pointee(ring),
        }
    }

    /// The snapshot to use for one whole operation.
    pub fn load(&self) -> Arc<HashRing> {
        self.current.load_full()
    }

    /// Publish `next`, returning the snapshot it replaced.
    pub fn swap(&self, next: HashRing) -> Arc<HashRing> {
        self.current.swap(Arc::new(next))
    }
}
