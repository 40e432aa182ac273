//! Tracing setup: stderr plus a daily-rotated file under `~/.eocc/daemon/`.
//!
//! Filter precedence: `EOCC_DEBUG_LOG` (forces `debug`), then `RUST_LOG`,
//! then the configured level.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "eocc-daemon.log";
const DEBUG_ENV: &str = "EOCC_DEBUG_LOG";

/// Keeps the non-blocking file writer alive; pending lines flush on drop.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

pub fn init(log_dir: &Path, configured_level: &str) -> LoggingGuard {
    let filter = build_filter(
        std::env::var(DEBUG_ENV).ok().as_deref(),
        configured_level,
    );

    let (file_layer, guard) = match fs_err::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true);
            (Some(layer), Some(guard))
        }
        Err(err) => {
            eprintln!("eocc-daemon: file logging disabled: {err}");
            (None, None)
        }
    };

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    tracing::debug!(log_dir = %log_dir.display(), "Logging initialized");
    LoggingGuard { _file: guard }
}

fn build_filter(debug_env: Option<&str>, configured_level: &str) -> EnvFilter {
    if debug_env.is_some_and(is_truthy) {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES")
}
