//! eocc daemon entrypoint.
//!
//! Single-writer service behind the eocc dashboard. Hooks append events to
//! `~/.eocc/logs/events.jsonl`; this process drains that queue on a fixed
//! tick, reduces the events into per-project session state, persists a
//! snapshot, and serves it to UI clients over a Unix socket.

use clap::Parser;
use fs_err as fs;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{error, info, warn};

mod config;
mod drain;
mod error;
mod history;
mod ipc;
mod logging;
mod persist;
mod publish;
mod queue;
mod reducer;
mod store;

use config::{eocc_root, load_config, DaemonConfig, DaemonPaths};
use drain::{Command, DrainLoop};
use error::{DaemonError, Result};
use ipc::IpcContext;
use publish::SubscriberHub;
use queue::QueueFiles;
use store::StateStore;

#[derive(Parser)]
#[command(name = "eocc-daemon")]
#[command(about = "Drains the eocc event queue and serves session state")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.eocc/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the configured poll interval
    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,

    /// Drain only; do not open the IPC socket
    #[arg(long)]
    no_ipc: bool,
}

fn main() {
    let cli = Cli::parse();

    let root = match eocc_root() {
        Ok(root) => root,
        Err(err) => {
            eprintln!("eocc-daemon: {err}");
            std::process::exit(1);
        }
    };

    let config_result = load_config(cli.config.clone());
    let mut config = config_result.as_ref().cloned().unwrap_or_default();
    if let Some(poll_interval_ms) = cli.poll_interval_ms {
        config.poll_interval_ms = poll_interval_ms;
    }
    let paths = DaemonPaths::resolve(&root, &config.paths);

    let _logging_guard = logging::init(&paths.log_dir, &config.log_level);
    if let Err(err) = &config_result {
        warn!(error = %err, "Failed to load daemon config; using defaults");
    }

    if let Err(err) = run(&cli, &config, &paths) {
        error!(error = %err, "eocc daemon failed");
        std::process::exit(1);
    }
}

fn run(cli: &Cli, config: &DaemonConfig, paths: &DaemonPaths) -> Result<()> {
    let poll_interval = config.poll_interval();
    info!(
        queue = %paths.queue_file.display(),
        snapshot = %paths.snapshot_path.display(),
        poll_interval_ms = poll_interval.as_millis() as u64,
        history_capacity = config.history_capacity,
        "eocc daemon starting"
    );

    let hub = Arc::new(SubscriberHub::new());
    let store = StateStore::load(&paths.snapshot_path, config.history_capacity)
        .with_publisher(hub.clone());
    let snapshots = store.handle();

    let mut drain = DrainLoop::new(QueueFiles::new(&paths.queue_file), store, poll_interval);
    let recovered = drain.recover();
    if recovered.batches > 0 {
        info!(
            batches = recovered.batches,
            applied = recovered.applied,
            "Recovered orphaned batches"
        );
    }

    let (commands, command_rx) = mpsc::channel();

    if !cli.no_ipc {
        let listener = bind_socket(&paths.socket_path)?;
        info!(path = %paths.socket_path.display(), "IPC socket listening");
        let context = Arc::new(IpcContext::new(
            snapshots,
            hub,
            commands.clone(),
            paths.queue_file.clone(),
            poll_interval,
        ));
        thread::spawn(move || ipc::serve(listener, context));
    }

    let shutdown = commands.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = shutdown.send(Command::Shutdown);
    }) {
        warn!(error = %err, "Failed to install signal handler");
    }

    let store = drain.run(command_rx);
    info!(sessions = store.session_count(), "eocc daemon stopped");

    if !cli.no_ipc {
        let _ = fs::remove_file(&paths.socket_path);
    }
    Ok(())
}

fn bind_socket(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| DaemonError::io("create socket directory", err))?;
    }
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| DaemonError::io("remove existing socket", err))?;
    }
    UnixListener::bind(socket_path).map_err(|err| DaemonError::io("bind daemon socket", err))
}
