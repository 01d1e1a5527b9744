//! Session registry
//!
//! Concurrent map from session id to session. The map lock is only held for
//! membership changes and snapshots, never across an await and never while a
//! caller holds a session lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use super::types::{Session, SessionFilter, SessionId, SessionSummary};
use crate::error::{Error, Result};

/// A registered session together with its exclusion domain
#[derive(Debug)]
pub struct SessionCell {
    seq: u64,
    id: SessionId,
    session: Mutex<Session>,
}

impl SessionCell {
    fn new(seq: u64, session: Session) -> Self {
        Self {
            seq,
            id: session.id().to_string(),
            session: Mutex::new(session),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation order within the registry
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Enter the session's exclusion domain
    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock()
    }

    pub fn summary(&self) -> SessionSummary {
        self.lock().summary()
    }
}

/// Shared handle to a registered session
pub type SessionHandle = Arc<SessionCell>;

/// Concurrent session registry
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    next_seq: AtomicU64,
    max_sessions: Option<usize>,
}

impl SessionRegistry {
    /// Create a registry, optionally bounded to `max_sessions` entries
    pub fn new(max_sessions: Option<usize>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            max_sessions,
        }
    }

    fn make_cell(&self, id: &str) -> SessionHandle {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        Arc::new(SessionCell::new(seq, Session::new(id, None)))
    }

    /// Return the session for `id`, creating it if absent.
    ///
    /// The boolean is true when this call created the session. Concurrent
    /// callers racing on a new id all receive the same instance.
    pub fn get_or_create(&self, id: &str) -> Result<(SessionHandle, bool)> {
        if let Some(existing) = self.sessions.read().get(id) {
            return Ok((Arc::clone(existing), false));
        }

        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(id) {
            return Ok((Arc::clone(existing), false));
        }

        if let Some(max) = self.max_sessions {
            if sessions.len() >= max {
                return Err(Error::CapacityExceeded(max));
            }
        }

        let cell = self.make_cell(id);
        sessions.insert(id.to_string(), Arc::clone(&cell));
        info!(session_id = %id, "Created session");
        Ok((cell, true))
    }

    /// Swap a finished session for a fresh one under the same id.
    ///
    /// Returns the current entry unchanged if it is not (or no longer) in a
    /// terminal state, so the caller re-validates against it.
    pub fn replace_finished(&self, id: &str) -> Result<(SessionHandle, bool)> {
        let mut sessions = self.sessions.write();
        match sessions.get(id) {
            Some(existing) if !existing.lock().state().is_terminal() => {
                Ok((Arc::clone(existing), false))
            }
            Some(_) => {
                let cell = self.make_cell(id);
                sessions.insert(id.to_string(), Arc::clone(&cell));
                info!(session_id = %id, "Replaced finished session");
                Ok((cell, true))
            }
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    /// Look up a session
    pub fn get(&self, id: &str) -> Result<SessionHandle> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Check if a session exists
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Snapshot the registry for lazy enumeration
    pub fn list(&self, filter: SessionFilter) -> SessionList {
        let mut cells: Vec<SessionHandle> = self.sessions.read().values().cloned().collect();
        cells.sort_by_key(|cell| cell.seq());
        SessionList { cells, filter }
    }

    /// Administrative eviction
    pub fn remove(&self, id: &str) -> Result<SessionHandle> {
        let removed = self.sessions.write().remove(id);
        match removed {
            Some(cell) => {
                debug!(session_id = %id, "Removed session from registry");
                Ok(cell)
            }
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    /// Remove `id` only if it still maps to `cell`
    pub(crate) fn remove_exact(&self, id: &str, cell: &SessionHandle) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(id) {
            Some(current) if Arc::ptr_eq(current, cell) => {
                sessions.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Restartable listing over a registry snapshot.
///
/// Membership is fixed when the list is taken; each summary is read from
/// its session only when the iterator reaches it.
#[derive(Debug, Clone)]
pub struct SessionList {
    cells: Vec<SessionHandle>,
    filter: SessionFilter,
}

impl SessionList {
    /// Iterate summaries in creation order
    pub fn iter(&self) -> impl Iterator<Item = SessionSummary> + '_ {
        self.cells.iter().filter_map(|cell| {
            let session = cell.lock();
            self.filter
                .matches(session.state())
                .then(|| session.summary())
        })
    }

    /// Handles in the snapshot, ignoring the filter
    pub fn handles(&self) -> &[SessionHandle] {
        &self.cells
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn to_vec(&self) -> Vec<SessionSummary> {
        self.iter().collect()
    }
}
