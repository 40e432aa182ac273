//! Session view types shared by the daemon and its UI clients.

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Placeholder the hook writes when the host did not report a project dir.
pub const UNKNOWN_PROJECT_DIR: &str = "unknown";

/// Resolves the identity a session is stored under: the project directory,
/// falling back to the project name when the directory is absent.
pub fn session_key<'a>(project_dir: &'a str, project_name: &'a str) -> Option<&'a str> {
    let dir = project_dir.trim();
    if !dir.is_empty() && dir != UNKNOWN_PROJECT_DIR {
        return Some(project_dir);
    }

    if !project_name.trim().is_empty() {
        return Some(project_name);
    }

    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    WaitingPermission,
    WaitingInput,
    Completed,
}

impl SessionStatus {
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            SessionStatus::WaitingPermission | SessionStatus::WaitingInput
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "Active",
            SessionStatus::WaitingPermission => "WaitingPermission",
            SessionStatus::WaitingInput => "WaitingInput",
            SessionStatus::Completed => "Completed",
        }
    }

    /// Tray glyph.
    pub fn glyph(&self) -> &'static str {
        match self {
            SessionStatus::Active => "🟢",
            SessionStatus::WaitingPermission => "🔐",
            SessionStatus::WaitingInput => "⏳",
            SessionStatus::Completed => "✅",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub project_name: String,
    pub project_dir: String,
    #[serde(default)]
    pub session_id: String,
    pub status: SessionStatus,
    pub last_event: String,
    #[serde(default)]
    pub waiting_for: String,
}

impl Session {
    pub fn key(&self) -> Option<&str> {
        session_key(&self.project_dir, &self.project_name)
    }
}

/// Immutable view of the whole store: sessions ordered by key, history
/// oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sessions: Vec<Session>,
    pub events: Vec<Event>,
}

impl Snapshot {
    pub fn waiting_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|session| session.status.is_waiting())
            .count()
    }

    /// The newest `limit` events, newest first.
    pub fn recent_events(&self, limit: usize) -> impl Iterator<Item = &Event> {
        self.events.iter().rev().take(limit)
    }
}
