//! Durable snapshot of the store (`runtime_state.json`).
//!
//! # File Format
//!
//! ```json
//! {
//!   "sessions": [ { ...Session fields... } ],
//!   "events": [ { ...Event fields... } ],
//!   "applied_batches": [ "01J0…" ]
//! }
//! ```
//!
//! Older snapshots stored `sessions` as an object keyed by session key and
//! history under `recent_events`; both shapes are still read.
//!
//! Reading is defensive: a missing, empty or corrupt file means "start
//! empty", never a startup failure. Writing goes through a temp file in the
//! same directory followed by a rename so a crash mid-write leaves the
//! previous snapshot intact.

use eocc_protocol::{Event, Session};
use fs_err as fs;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{DaemonError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default, deserialize_with = "session_list_or_map")]
    pub sessions: Vec<Session>,
    #[serde(default, alias = "recent_events")]
    pub events: Vec<Event>,
    /// Tokens of processing files whose effects this snapshot already
    /// includes, oldest first.
    #[serde(default)]
    pub applied_batches: Vec<String>,
}

/// Accepts the current list form and the older keyed-object form. Keys of
/// the object form are dropped; the store re-derives them from each session.
fn session_list_or_map<'de, D>(deserializer: D) -> std::result::Result<Vec<Session>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Sessions {
        List(Vec<Session>),
        Keyed(BTreeMap<String, Session>),
    }

    Ok(match Option::<Sessions>::deserialize(deserializer)? {
        Some(Sessions::List(sessions)) => sessions,
        Some(Sessions::Keyed(sessions)) => sessions.into_values().collect(),
        None => Vec::new(),
    })
}

/// Returns `None` when there is nothing usable on disk.
pub fn load_snapshot(path: &Path) -> Option<PersistedState> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No runtime snapshot; starting empty");
            return None;
        }
        Err(err) => {
            warn!(error = %err, "Failed to read runtime snapshot; starting empty");
            return None;
        }
    };

    if content.trim().is_empty() {
        warn!(path = %path.display(), "Empty runtime snapshot; starting empty");
        return None;
    }

    match serde_json::from_str::<PersistedState>(&content) {
        Ok(state) => Some(state),
        Err(err) => {
            warn!(
                error = %err,
                path = %path.display(),
                "Failed to parse runtime snapshot; starting empty"
            );
            None
        }
    }
}

pub fn save_snapshot(path: &Path, state: &PersistedState) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|err| DaemonError::io("create snapshot directory", err))?;

    let content = serde_json::to_vec_pretty(state)
        .map_err(|err| DaemonError::json("serialize runtime snapshot", err))?;

    let mut temp_file = NamedTempFile::new_in(parent)
        .map_err(|err| DaemonError::io("create temp snapshot", err))?;
    temp_file
        .write_all(&content)
        .map_err(|err| DaemonError::io("write temp snapshot", err))?;
    temp_file
        .flush()
        .map_err(|err| DaemonError::io("flush temp snapshot", err))?;
    temp_file
        .persist(path)
        .map_err(|err| DaemonError::io("commit runtime snapshot", err.error))?;

    Ok(())
}
