//! Local Session Store
//!
//! The single-node collaborator the cluster layer writes through:
//! - Session CRUD keyed by id
//! - Verbatim storage of replica and migrated images
//! - Capacity limits and size accounting for metrics

use dashmap::mapref::entry::{Entry, VacantEntry};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::cluster::types::{Session, SessionConfig, SessionPatch};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub sessions: usize,
    pub capacity: usize,
    pub approx_bytes: u64,
}

/// Contract every single-node session store satisfies.
pub trait LocalSessionStore: Send + Sync + Debug {
    /// Create a session, using `config.id` when the caller picked one.
    fn create_session(&self, config: SessionConfig) -> Result<Session>;

    fn get_session(&self, id: &str) -> Result<Option<Session>>;

    fn update_session(&self, id: &str, patch: SessionPatch) -> Result<Option<Session>>;

    /// Returns false when there was nothing to delete.
    fn delete_session(&self, id: &str) -> Result<bool>;

    /// Store an image produced elsewhere; the newer `updated_at` wins.
    fn put_session(&self, session: Session) -> Result<bool>;

    /// Store an image only if no copy exists yet.
    fn insert_if_absent(&self, session: Session) -> Result<bool>;

    fn session_ids(&self) -> Vec<String>;

    fn stats(&self) -> StoreStats;
}

#[derive(Debug)]
struct Stored {
    session: Session,
    bytes: u64,
}

impl Stored {
    fn new(session: Session) -> Self {
        let bytes = serde_json::to_vec(&session).map(|v| v.len() as u64).unwrap_or(0);
        Self { session, bytes }
    }
}

#[derive(Debug)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Stored>,
    capacity: usize,
    /// Encoded size of every held session, kept current on each write
    bytes: AtomicU64,
}

impl InMemorySessionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            capacity,
            bytes: AtomicU64::new(0),
        }
    }

    fn ensure_room(&self) -> Result<()> {
        if self.sessions.len() >= self.capacity {
            return Err(OrchestratorError::CapacityExceeded(self.capacity));
        }
        Ok(())
    }

    fn replace(&self, slot: &mut Stored, session: Session) {
        let stored = Stored::new(session);
        self.bytes.fetch_sub(slot.bytes, Ordering::Relaxed);
        self.bytes.fetch_add(stored.bytes, Ordering::Relaxed);
        *slot = stored;
    }

    fn insert_vacant(&self, slot: VacantEntry<'_, String, Stored>, session: Session) {
        let stored = Stored::new(session);
        self.bytes.fetch_add(stored.bytes, Ordering::Relaxed);
        slot.insert(stored);
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl LocalSessionStore for InMemorySessionStore {
    fn create_session(&self, config: SessionConfig) -> Result<Session> {
        self.ensure_room()?;
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => Err(OrchestratorError::store(format!("Session {} already exists", id))),
            Entry::Vacant(slot) => {
                let session = Session::from_config(id, config);
                self.insert_vacant(slot, session.clone());
                debug!("Created session {}", session.id);
                Ok(session)
            }
        }
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).map(|s| s.session.clone()))
    }

    fn update_session(&self, id: &str, patch: SessionPatch) -> Result<Option<Session>> {
        Ok(self.sessions.get_mut(id).map(|mut slot| {
            let mut session = slot.session.clone();
            session.apply(patch);
            self.replace(&mut *slot, session.clone());
            session
        }))
    }

    fn delete_session(&self, id: &str) -> Result<bool> {
        match self.sessions.remove(id) {
            Some((_, stored)) => {
                self.bytes.fetch_sub(stored.bytes, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn put_session(&self, session: Session) -> Result<bool> {
        if !self.sessions.contains_key(&session.id) {
            self.ensure_room()?;
        }
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(mut existing) => {
                if session.updated_at >= existing.get().session.updated_at {
                    self.replace(existing.get_mut(), session);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(slot) => {
                self.insert_vacant(slot, session);
                Ok(true)
            }
        }
    }

    fn insert_if_absent(&self, session: Session) -> Result<bool> {
        if self.sessions.contains_key(&session.id) {
            return Ok(false);
        }
        self.ensure_room()?;
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                self.insert_vacant(slot, session);
                Ok(true)
            }
        }
    }

    fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            sessions: self.sessions.len(),
            capacity: self.capacity,
            approx_bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}
