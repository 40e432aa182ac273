//! Error types for the daemon.
//!
//! Ingestion errors never escape the drain loop; these types exist so the
//! places that *do* fail (startup, one filesystem step of a cycle, a
//! snapshot write) can say precisely what went wrong before the caller logs
//! and moves on.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DaemonError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        DaemonError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DaemonError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        DaemonError::Json {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
