//! Session state machine.
//!
//! ```text
//! session_start                   → Active (creates or replaces)
//! notification/permission_prompt  → WaitingPermission
//! notification/idle_prompt        → WaitingInput
//! post_tool_use                   → Active
//! user_prompt_submit              → Active
//! stop                            → Completed
//! session_end                     → removed
//! anything else                   → last_event only
//! ```
//!
//! Only `session_start` brings a session into existence. Every other event
//! for a key with no session is a no-op here (it still lands in history).

use eocc_protocol::{Event, EventKind, NotificationType, Session, SessionStatus};

const WAITING_SUMMARY_MAX_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Upsert(Session),
    Delete { key: String },
    Skip,
}

/// Pure and total: every (session, event) pair maps to an update.
pub fn reduce_session(current: Option<&Session>, event: &Event) -> SessionUpdate {
    let key = match event.session_key() {
        Some(key) => key,
        None => return SessionUpdate::Skip,
    };

    match event.kind {
        EventKind::SessionStart => SessionUpdate::Upsert(start_session(event)),
        EventKind::SessionEnd => match current {
            Some(_) => SessionUpdate::Delete {
                key: key.to_string(),
            },
            None => SessionUpdate::Skip,
        },
        _ => {
            let current = match current {
                Some(session) => session,
                None => return SessionUpdate::Skip,
            };
            let updated = match transition_for(event) {
                Some((status, waiting_for)) => apply(current, event, status, waiting_for),
                None => touch(current, event),
            };
            SessionUpdate::Upsert(updated)
        }
    }
}

fn transition_for(event: &Event) -> Option<(SessionStatus, String)> {
    match event.kind {
        EventKind::Notification => match event.notification_type {
            NotificationType::PermissionPrompt => {
                let reason = if event.message.trim().is_empty() {
                    event.tool_name.as_str()
                } else {
                    event.message.as_str()
                };
                Some((SessionStatus::WaitingPermission, summarize(reason)))
            }
            NotificationType::IdlePrompt => {
                Some((SessionStatus::WaitingInput, summarize(&event.message)))
            }
            NotificationType::Other => None,
        },
        EventKind::Stop => Some((SessionStatus::Completed, String::new())),
        EventKind::PostToolUse | EventKind::UserPromptSubmit => {
            Some((SessionStatus::Active, String::new()))
        }
        EventKind::SessionStart | EventKind::SessionEnd | EventKind::Unknown => None,
    }
}

fn start_session(event: &Event) -> Session {
    Session {
        project_name: event.project_name.clone(),
        project_dir: event.project_dir.clone(),
        session_id: event.session_id.clone(),
        status: SessionStatus::Active,
        last_event: event.timestamp.clone(),
        waiting_for: String::new(),
    }
}

fn apply(current: &Session, event: &Event, status: SessionStatus, waiting_for: String) -> Session {
    let mut next = touch(current, event);
    next.status = status;
    next.waiting_for = waiting_for;
    next
}

fn touch(current: &Session, event: &Event) -> Session {
    let mut next = current.clone();
    next.last_event = event.timestamp.clone();
    if !event.session_id.trim().is_empty() {
        next.session_id = event.session_id.clone();
    }
    next
}

/// First non-empty line, trimmed and capped for display.
fn summarize(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");

    if line.chars().count() <= WAITING_SUMMARY_MAX_CHARS {
        return line.to_string();
    }

    let mut summary: String = line.chars().take(WAITING_SUMMARY_MAX_CHARS - 1).collect();
    summary.push('…');
    summary
}
