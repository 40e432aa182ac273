//! eocc-hook: appends one session event to the eocc queue.
//!
//! Configured as the command for each hook in the host tool's settings,
//! e.g. `eocc-hook notification permission_prompt`. Reads the hook payload
//! from stdin and writes a single line to `~/.eocc/logs/events.jsonl`, where
//! eocc-daemon picks it up.
//!
//! Always exits 0: a broken monitor must never block the host tool.

mod handle;
mod logging;

use clap::error::ErrorKind;
use clap::Parser;

#[derive(Parser)]
#[command(name = "eocc-hook")]
#[command(about = "Append a session event to the eocc queue")]
#[command(version)]
struct Cli {
    /// Event kind (session_start, notification, stop, ...)
    #[arg(value_name = "KIND")]
    kind: String,

    /// Hook matcher (e.g. startup, resume, permission_prompt)
    #[arg(value_name = "MATCHER")]
    matcher: Option<String>,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "eocc-hook invoked with bad arguments");
            return;
        }
    };

    if let Err(e) = handle::run(&cli.kind, cli.matcher.as_deref()) {
        tracing::warn!(error = %e, kind = %cli.kind, "eocc-hook failed");
    }
}
