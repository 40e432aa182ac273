//! Turns one hook invocation into one queue line.
//!
//! The hook payload on stdin is whatever the host tool sends; every field we
//! look at is optional. The event kind comes from the command line, and for
//! notifications the matcher doubles as the notification type when the
//! payload does not carry one.

use chrono::{DateTime, SecondsFormat, Utc};
use eocc_protocol::{
    append_event, AppendError, Event, EventKind, NotificationType, QUEUE_FILE_NAME,
    UNKNOWN_PROJECT_DIR,
};
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const PROJECT_DIR_ENV: &str = "CLAUDE_PROJECT_DIR";

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Failed to read stdin: {0}")]
    ReadStdin(#[source] io::Error),

    #[error("Cannot determine home directory")]
    HomeNotFound,

    #[error("Failed to append event: {0}")]
    Append(#[from] AppendError),
}

/// Fields of the hook payload we care about.
#[derive(Debug, Default, Deserialize)]
struct HookInput {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    notification_type: Option<String>,
    #[serde(default)]
    tool_name: Option<String>,
}

pub fn run(kind: &str, matcher: Option<&str>) -> Result<(), HookError> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .map_err(HookError::ReadStdin)?;

    let home = dirs::home_dir().ok_or(HookError::HomeNotFound)?;
    let project_dir_env = env::var(PROJECT_DIR_ENV).ok();
    let event = build_event(kind, matcher, &input, project_dir_env.as_deref(), Utc::now());

    let queue = queue_path(&home);
    append_event(&queue, &event)?;
    tracing::debug!(
        event = event.kind.as_str(),
        project_dir = %event.project_dir,
        queue = %queue.display(),
        "Appended hook event"
    );
    Ok(())
}

pub fn queue_path(home: &Path) -> PathBuf {
    home.join(".eocc").join("logs").join(QUEUE_FILE_NAME)
}

pub fn build_event(
    kind: &str,
    matcher: Option<&str>,
    raw: &str,
    project_dir_env: Option<&str>,
    now: DateTime<Utc>,
) -> Event {
    let raw_input = parse_raw_input(raw);
    let input = serde_json::from_value::<HookInput>(raw_input.clone()).unwrap_or_else(|err| {
        if !raw_input.is_null() {
            tracing::warn!(error = %err, "Hook payload has unexpected shape; using defaults");
        }
        HookInput::default()
    });

    let kind = EventKind::from_name(kind);
    if kind == EventKind::Unknown {
        tracing::warn!("Unrecognized hook event kind");
    }
    let matcher = matcher.unwrap_or_default().to_string();

    let notification_type = match input.notification_type.as_deref() {
        Some(value) if !value.trim().is_empty() => NotificationType::from_name(value),
        _ if kind == EventKind::Notification => NotificationType::from_name(&matcher),
        _ => NotificationType::Other,
    };

    let project_dir = resolve_project_dir(project_dir_env, input.cwd.as_deref());
    let project_name = project_name_of(&project_dir);

    Event {
        timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        kind,
        matcher,
        project_name,
        project_dir,
        session_id: input.session_id.unwrap_or_default(),
        message: input.message.unwrap_or_default(),
        notification_type,
        tool_name: input.tool_name.unwrap_or_default(),
        raw_input,
    }
}

/// JSON payloads are kept as JSON; anything else is kept verbatim as a
/// string so nothing the host sent is lost.
fn parse_raw_input(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn resolve_project_dir(env_dir: Option<&str>, cwd: Option<&str>) -> String {
    [env_dir, cwd]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|dir| !dir.is_empty())
        .unwrap_or(UNKNOWN_PROJECT_DIR)
        .to_string()
}

fn project_name_of(project_dir: &str) -> String {
    Path::new(project_dir)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(project_dir)
        .to_string()
}
