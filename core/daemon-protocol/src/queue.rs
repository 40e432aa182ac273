//! Queue file contract shared by the producer (hook) and the consumer
//! (daemon).
//!
//! The producer opens the queue for append, writes exactly one JSON line,
//! and closes it. The consumer renames the queue to a processing file in the
//! same directory before reading it, so the naming convention below is the
//! only thing both sides must agree on.

use fs_err::{self as fs, OpenOptions};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

use crate::event::Event;

pub const QUEUE_FILE_NAME: &str = "events.jsonl";
pub const PROCESSING_PREFIX: &str = "events.processing.";
pub const PROCESSING_SUFFIX: &str = ".jsonl";

pub fn processing_file_name(token: &str) -> String {
    format!("{PROCESSING_PREFIX}{token}{PROCESSING_SUFFIX}")
}

/// Extracts the token from a processing file name, or `None` for any other
/// file (including the live queue).
pub fn processing_token(file_name: &str) -> Option<&str> {
    let token = file_name
        .strip_prefix(PROCESSING_PREFIX)?
        .strip_suffix(PROCESSING_SUFFIX)?;
    if token.is_empty() || token.contains('/') {
        None
    } else {
        Some(token)
    }
}

#[derive(Debug, Error)]
pub enum AppendError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to append to queue: {0}")]
    Io(#[from] std::io::Error),
}

/// Appends one event as a single line. The whole line goes out in one
/// `write_all` on an `O_APPEND` handle so concurrent appenders never
/// interleave within a line.
pub fn append_event(queue_path: &Path, event: &Event) -> Result<(), AppendError> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');

    if let Some(parent) = queue_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(queue_path)?;
    file.write_all(&line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{parse_line, EventKind};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn processing_names_round_trip_token() {
        let name = processing_file_name("01HZX3");
        assert_eq!(name, "events.processing.01HZX3.jsonl");
        assert_eq!(processing_token(&name), Some("01HZX3"));
        assert_eq!(processing_token(QUEUE_FILE_NAME), None);
        assert_eq!(processing_token("events.processing..jsonl"), None);
        assert_eq!(processing_token("runtime_state.json"), None);
    }

    #[test]
    fn append_writes_one_line_per_event() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let queue = temp_dir.path().join("logs").join(QUEUE_FILE_NAME);

        let mut event = Event {
            timestamp: "2026-01-31T00:00:00Z".to_string(),
            kind: EventKind::SessionStart,
            project_dir: "/work/api".to_string(),
            message: "multi\nline".to_string(),
            ..Default::default()
        };
        append_event(&queue, &event).expect("append first");
        event.kind = EventKind::Stop;
        append_event(&queue, &event).expect("append second");

        let content = std::fs::read(&queue).expect("read queue");
        let lines: Vec<&[u8]> = content
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(parse_line(lines[0]).expect("line 0").message, "multi\nline");
        assert_eq!(parse_line(lines[1]).expect("line 1").kind, EventKind::Stop);
    }

    #[test]
    fn concurrent_appenders_never_tear_lines() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let queue = Arc::new(temp_dir.path().join(QUEUE_FILE_NAME));

        let handles: Vec<_> = (0..4)
            .map(|writer| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for index in 0..25 {
                        let event = Event {
                            timestamp: format!("t{index}"),
                            kind: EventKind::PostToolUse,
                            project_dir: format!("/writer/{writer}"),
                            ..Default::default()
                        };
                        append_event(&queue, &event).expect("append");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        let content = std::fs::read(queue.as_path()).expect("read queue");
        let parsed: Vec<Event> = content
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| parse_line(line).expect("intact line"))
            .collect();
        assert_eq!(parsed.len(), 100);
    }
}
