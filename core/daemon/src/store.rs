//! Authoritative in-memory state: the session map plus event history.
//!
//! The drain loop owns the only `StateStore`, so nothing in here locks.
//! Mutations mark the store dirty; [`StateStore::commit`] turns a dirty
//! store into one published snapshot and one snapshot write.

use eocc_protocol::{Event, Session, Snapshot};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::history::EventHistory;
use crate::persist::{load_snapshot, save_snapshot, PersistedState};
use crate::publish::{Publisher, SnapshotHandle};
use crate::reducer::{reduce_session, SessionUpdate};

/// Applied-batch tokens kept for orphan deduplication.
const MAX_APPLIED_BATCHES: usize = 32;

pub struct StateStore {
    sessions: BTreeMap<String, Session>,
    history: EventHistory,
    applied_batches: VecDeque<String>,
    snapshot_path: Option<PathBuf>,
    handle: SnapshotHandle,
    publishers: Vec<Arc<dyn Publisher>>,
    dirty: bool,
}

impl StateStore {
    pub fn new_in_memory(history_capacity: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            history: EventHistory::new(history_capacity),
            applied_batches: VecDeque::new(),
            snapshot_path: None,
            handle: SnapshotHandle::default(),
            publishers: Vec::new(),
            dirty: false,
        }
    }

    /// Restores the last persisted snapshot, or starts empty when there is
    /// none. Never fails.
    pub fn load(snapshot_path: &Path, history_capacity: usize) -> Self {
        let mut store = Self::new_in_memory(history_capacity);
        store.snapshot_path = Some(snapshot_path.to_path_buf());

        if let Some(persisted) = load_snapshot(snapshot_path) {
            store.restore(persisted);
            info!(
                sessions = store.sessions.len(),
                events = store.history.len(),
                path = %snapshot_path.display(),
                "Restored runtime snapshot"
            );
        }

        store.handle.replace(Arc::new(store.snapshot()));
        store
    }

    fn restore(&mut self, persisted: PersistedState) {
        for session in persisted.sessions {
            match session.key() {
                Some(key) => {
                    self.sessions.insert(key.to_string(), session);
                }
                None => warn!("Dropping persisted session without identity"),
            }
        }
        self.history = EventHistory::restore(persisted.events, self.history.capacity());
        for token in persisted.applied_batches {
            self.remember_batch(token);
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn handle(&self) -> SnapshotHandle {
        self.handle.clone()
    }

    /// Records the event in history and reduces it into the session map.
    /// Returns whether the session map changed.
    pub fn apply_event(&mut self, event: Event) -> bool {
        let changed = match event.session_key() {
            Some(key) => {
                let key = key.to_string();
                let update = reduce_session(self.sessions.get(&key), &event);
                self.apply_update(&key, update)
            }
            None => false,
        };

        self.history.push(event);
        self.dirty = true;
        changed
    }

    fn apply_update(&mut self, key: &str, update: SessionUpdate) -> bool {
        match update {
            SessionUpdate::Upsert(session) => {
                if self.sessions.get(key) == Some(&session) {
                    return false;
                }
                debug!(
                    key = %key,
                    status = session.status.as_str(),
                    waiting_for = %session.waiting_for,
                    "Session upsert"
                );
                self.sessions.insert(key.to_string(), session);
                true
            }
            SessionUpdate::Delete { key } => {
                debug!(key = %key, "Session removed");
                self.sessions.remove(&key).is_some()
            }
            SessionUpdate::Skip => false,
        }
    }

    /// UI command: drop one session by key.
    pub fn remove_session(&mut self, key: &str) -> bool {
        let removed = self.sessions.remove(key).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    /// UI command: drop every session. History is kept.
    pub fn clear_sessions(&mut self) -> usize {
        let count = self.sessions.len();
        if count > 0 {
            self.sessions.clear();
            self.dirty = true;
        }
        count
    }

    pub fn mark_batch_applied(&mut self, token: &str) {
        if !self.is_batch_applied(token) {
            self.remember_batch(token.to_string());
        }
    }

    pub fn is_batch_applied(&self, token: &str) -> bool {
        self.applied_batches.iter().any(|applied| applied == token)
    }

    fn remember_batch(&mut self, token: String) {
        self.applied_batches.push_back(token);
        while self.applied_batches.len() > MAX_APPLIED_BATCHES {
            self.applied_batches.pop_front();
        }
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Publishes and persists if anything changed since the last commit.
    /// Returns whether a commit happened.
    pub fn commit(&mut self) -> bool {
        if !self.dirty {
            return false;
        }
        self.dirty = false;

        let snapshot = Arc::new(self.snapshot());
        self.handle.replace(Arc::clone(&snapshot));
        for publisher in &self.publishers {
            publisher.publish(&snapshot);
        }

        if let Some(path) = &self.snapshot_path {
            let persisted = PersistedState {
                sessions: snapshot.sessions.clone(),
                events: snapshot.events.clone(),
                applied_batches: self.applied_batches.iter().cloned().collect(),
            };
            if let Err(err) = save_snapshot(path, &persisted) {
                warn!(error = %err, "Failed to persist runtime snapshot; keeping in-memory state");
            }
        }

        true
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            sessions: self.sessions.values().cloned().collect(),
            events: self.history.to_vec(),
        }
    }

    #[cfg(test)]
    pub fn session(&self, key: &str) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn history(&self) -> &EventHistory {
        &self.history
    }
}
