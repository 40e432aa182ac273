//! Daemon configuration and on-disk layout.
//!
//! Everything lives under `~/.eocc`:
//!
//! ```text
//! ~/.eocc/
//! ├── config.toml                  optional, see DaemonConfig
//! ├── runtime_state.json           persisted snapshot
//! ├── daemon.sock                  IPC socket
//! ├── daemon/                      daemon logs
//! └── logs/
//!     ├── events.jsonl             live queue (appended by the hook)
//!     └── events.processing.*.jsonl
//! ```

use eocc_protocol::{HISTORY_CAPACITY, QUEUE_FILE_NAME};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DaemonError, Result};

pub const ROOT_DIR_NAME: &str = ".eocc";
const CONFIG_FILE_NAME: &str = "config.toml";
const SNAPSHOT_FILE_NAME: &str = "runtime_state.json";
const SOCKET_NAME: &str = "daemon.sock";

const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const MIN_POLL_INTERVAL_MS: u64 = 20;
const MAX_POLL_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub poll_interval_ms: u64,
    pub history_capacity: usize,
    pub log_level: String,
    pub paths: PathOverrides,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            history_capacity: HISTORY_CAPACITY,
            log_level: "info".to_string(),
            paths: PathOverrides::default(),
        }
    }
}

impl DaemonConfig {
    /// Poll interval, clamped to a sane sub-second-ish range.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms
                .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PathOverrides {
    pub queue_dir: Option<PathBuf>,
    pub snapshot_path: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub queue_file: PathBuf,
    pub snapshot_path: PathBuf,
    pub socket_path: PathBuf,
    pub log_dir: PathBuf,
}

impl DaemonPaths {
    pub fn resolve(root: &Path, overrides: &PathOverrides) -> Self {
        let queue_dir = overrides
            .queue_dir
            .clone()
            .unwrap_or_else(|| root.join("logs"));
        Self {
            queue_file: queue_dir.join(QUEUE_FILE_NAME),
            snapshot_path: overrides
                .snapshot_path
                .clone()
                .unwrap_or_else(|| root.join(SNAPSHOT_FILE_NAME)),
            socket_path: overrides
                .socket_path
                .clone()
                .unwrap_or_else(|| root.join(SOCKET_NAME)),
            log_dir: root.join("daemon"),
        }
    }
}

pub fn eocc_root() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(DaemonError::HomeNotFound)?;
    Ok(home.join(ROOT_DIR_NAME))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(eocc_root()?.join(CONFIG_FILE_NAME))
}

/// Missing file → defaults. A file that exists but does not parse is an
/// error so the caller can warn about it.
pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path)
        .map_err(|err| DaemonError::io("read daemon config", err))?;
    toml::from_str::<DaemonConfig>(&content).map_err(|err| DaemonError::ConfigMalformed {
        path: config_path.clone(),
        details: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(Some(temp_dir.path().join("missing.toml"))).expect("load");
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.history_capacity, 50);
    }

    #[test]
    fn load_config_parses_partial_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
poll_interval_ms = 100
log_level = "debug"

[paths]
queue_dir = "/tmp/eocc-queue"
"#,
        )
        .expect("write config");

        let config = load_config(Some(path)).expect("load");
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.history_capacity, HISTORY_CAPACITY);
        assert_eq!(
            config.paths.queue_dir,
            Some(PathBuf::from("/tmp/eocc-queue"))
        );
    }

    #[test]
    fn load_config_reports_malformed_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "poll_interval_ms = \"fast\"").expect("write config");

        assert!(matches!(
            load_config(Some(path)),
            Err(DaemonError::ConfigMalformed { .. })
        ));
    }

    #[test]
    fn poll_interval_is_clamped() {
        let config = DaemonConfig {
            poll_interval_ms: 1,
            ..Default::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(20));

        let config = DaemonConfig {
            poll_interval_ms: 60_000,
            ..Default::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn paths_resolve_under_root_with_overrides() {
        let root = PathBuf::from("/home/dev/.eocc");
        let paths = DaemonPaths::resolve(&root, &PathOverrides::default());
        assert_eq!(paths.queue_file, root.join("logs").join("events.jsonl"));
        assert_eq!(paths.snapshot_path, root.join("runtime_state.json"));
        assert_eq!(paths.socket_path, root.join("daemon.sock"));

        let overrides = PathOverrides {
            queue_dir: Some(PathBuf::from("/var/q")),
            ..Default::default()
        };
        let paths = DaemonPaths::resolve(&root, &overrides);
        assert_eq!(paths.queue_file, PathBuf::from("/var/q/events.jsonl"));
    }
}
