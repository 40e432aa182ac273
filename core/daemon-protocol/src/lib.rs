//! Queue schema and IPC protocol types for eocc-daemon.
//!
//! This crate is shared by the daemon, the hook and UI clients to prevent
//! schema drift. The daemon remains the authority on validation, but
//! producers reuse the same types and [`append_event`] so every queue line
//! is written the way the daemon expects to read it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod event;
pub mod queue;
pub mod session;

pub use event::{parse_line, Event, EventKind, EventParseError, NotificationType};
pub use queue::{
    append_event, processing_file_name, processing_token, AppendError, PROCESSING_PREFIX,
    PROCESSING_SUFFIX, QUEUE_FILE_NAME,
};
pub use session::{session_key, Session, SessionStatus, Snapshot, UNKNOWN_PROJECT_DIR};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

/// Events retained in history.
pub const HISTORY_CAPACITY: usize = 50;
/// Events a dashboard normally shows.
pub const HISTORY_DISPLAY_LIMIT: usize = 10;

pub const ERROR_TOO_MANY_CONNECTIONS: &str = "too_many_connections";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetSnapshot,
    Subscribe,
    RemoveSession,
    ClearSessions,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoveSessionParams {
    pub key: String,
}

pub fn parse_remove_session(params: Option<Value>) -> Result<RemoveSessionParams, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::new("invalid_params", "key is required"))?;
    let parsed: RemoveSessionParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("remove_session params are invalid: {}", err),
        )
    })?;
    if parsed.key.trim().is_empty() {
        return Err(ErrorInfo::new("invalid_params", "key must not be empty"));
    }
    Ok(parsed)
}
