//! Queue event schema.
//!
//! Every line of the queue file decodes into one [`Event`]. Decoding is
//! deliberately lenient about *content* (unknown fields are ignored, an
//! unrecognized kind becomes [`EventKind::Unknown`], `null` text fields read
//! as empty) and strict about *shape* (the line must be a JSON object with a
//! timestamp and a session identity).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::session::session_key;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    Notification,
    Stop,
    PostToolUse,
    UserPromptSubmit,
    #[default]
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::SessionEnd => "session_end",
            EventKind::Notification => "notification",
            EventKind::Stop => "stop",
            EventKind::PostToolUse => "post_tool_use",
            EventKind::UserPromptSubmit => "user_prompt_submit",
            EventKind::Unknown => "unknown",
        }
    }

    /// Maps a wire name to a kind. Anything unrecognized is `Unknown`.
    pub fn from_name(value: &str) -> Self {
        match value.trim() {
            "session_start" => EventKind::SessionStart,
            "session_end" => EventKind::SessionEnd,
            "notification" => EventKind::Notification,
            "stop" => EventKind::Stop,
            "post_tool_use" => EventKind::PostToolUse,
            "user_prompt_submit" => EventKind::UserPromptSubmit,
            _ => EventKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    PermissionPrompt,
    IdlePrompt,
    #[default]
    #[serde(other)]
    Other,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::PermissionPrompt => "permission_prompt",
            NotificationType::IdlePrompt => "idle_prompt",
            NotificationType::Other => "other",
        }
    }

    pub fn from_name(value: &str) -> Self {
        match value.trim() {
            "permission_prompt" => NotificationType::PermissionPrompt,
            "idle_prompt" => NotificationType::IdlePrompt,
            _ => NotificationType::Other,
        }
    }
}

/// One ingested queue line.
///
/// The kind is written under the `event` key (the hook's historical field
/// name); `kind` is accepted when reading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, deserialize_with = "nullable_string")]
    pub timestamp: String,
    #[serde(
        rename = "event",
        alias = "kind",
        default,
        deserialize_with = "lenient_kind"
    )]
    pub kind: EventKind,
    #[serde(default, deserialize_with = "nullable_string")]
    pub matcher: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub project_name: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub project_dir: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub session_id: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub message: String,
    #[serde(default, deserialize_with = "lenient_notification_type")]
    pub notification_type: NotificationType,
    #[serde(default, deserialize_with = "nullable_string")]
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub raw_input: Value,
}

impl Event {
    /// Identity the reducer groups this event under, if it has one.
    pub fn session_key(&self) -> Option<&str> {
        session_key(&self.project_dir, &self.project_name)
    }

    pub fn validate(&self) -> Result<(), EventParseError> {
        if self.timestamp.trim().is_empty() {
            return Err(EventParseError::MissingField("timestamp"));
        }
        if self.session_key().is_none() {
            return Err(EventParseError::MissingField("project_dir"));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("line is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("line is not a JSON object")]
    NotAnObject,

    #[error("required field missing: {0}")]
    MissingField(&'static str),
}

/// Decodes one queue line. Surrounding whitespace (including a trailing
/// `\r`) is ignored.
pub fn parse_line(line: &[u8]) -> Result<Event, EventParseError> {
    let text = std::str::from_utf8(line).map_err(|_| EventParseError::InvalidUtf8)?;
    let value: Value = serde_json::from_str(text.trim())?;
    if !value.is_object() {
        return Err(EventParseError::NotAnObject);
    }

    let event: Event = serde_json::from_value(value)?;
    event.validate()?;
    Ok(event)
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_kind<'de, D>(deserializer: D) -> Result<EventKind, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(Value::as_str)
        .map(EventKind::from_name)
        .unwrap_or_default())
}

fn lenient_notification_type<'de, D>(deserializer: D) -> Result<NotificationType, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(Value::as_str)
        .map(NotificationType::from_name)
        .unwrap_or_default())
}
