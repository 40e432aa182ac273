//! File-only logging for the hook. Stdout and stderr belong to the host
//! tool, so nothing is ever written there.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

pub fn init() -> LoggingGuard {
    let Some(log_dir) = dirs::home_dir().map(|home| home.join(".eocc").join("hook")) else {
        return LoggingGuard { _file: None };
    };
    init_in(&log_dir)
}

fn init_in(log_dir: &Path) -> LoggingGuard {
    if fs_err::create_dir_all(log_dir).is_err() {
        return LoggingGuard { _file: None };
    }

    let debug_enabled = std::env::var("EOCC_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "eocc-hook.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init();

    LoggingGuard { _file: Some(guard) }
}
