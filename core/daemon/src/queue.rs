//! Filesystem side of the queue: rotation, orphan discovery and batch reads.
//!
//! Rotation renames the live queue to `events.processing.<ULID>.jsonl` in
//! the same directory and immediately recreates the queue path. The rename
//! is atomic, so an appender's open-write-close on the queue path lands
//! either in the rotated batch or in the fresh queue.
//!
//! An appender that opened the queue just before the rename still holds the
//! old inode and may finish its write into the batch after we started
//! reading. [`Batch`] therefore reads by offset and the drain loop keeps
//! reading until no new bytes show up before it deletes the file.

use eocc_protocol::{processing_file_name, processing_token};
use fs_err::{self as fs, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use ulid::{Generator, Ulid};

use crate::error::{DaemonError, Result};

pub struct QueueFiles {
    dir: PathBuf,
    queue: PathBuf,
    /// Tokens must sort in rotation order even within one millisecond.
    tokens: Generator,
}

impl QueueFiles {
    pub fn new(queue_file: &Path) -> Self {
        let dir = queue_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            dir,
            queue: queue_file.to_path_buf(),
            tokens: Generator::new(),
        }
    }

    pub fn queue_path(&self) -> &Path {
        &self.queue
    }

    /// Creates the queue directory and an empty queue file if missing.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|err| DaemonError::io("create queue dir", err))?;
        self.recreate_queue()
    }

    /// Never truncates: an appender may already have recreated the file
    /// between our rename and this call.
    fn recreate_queue(&self) -> Result<()> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.queue)
            .map(drop)
            .map_err(|err| DaemonError::io("recreate queue file", err))
    }

    /// Moves the current queue content aside. `Ok(None)` when there is
    /// nothing to drain.
    pub fn rotate(&mut self) -> Result<Option<Batch>> {
        let len = match fs::metadata(&self.queue) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.ensure()?;
                return Ok(None);
            }
            Err(err) => return Err(DaemonError::io("stat queue file", err)),
        };

        if len == 0 {
            return Ok(None);
        }

        let token = self.next_token();
        let target = self.dir.join(processing_file_name(&token));
        fs::rename(&self.queue, &target).map_err(|err| DaemonError::io("rotate queue", err))?;

        if let Err(err) = self.recreate_queue() {
            // Appenders create the file themselves; the next tick retries.
            warn!(error = %err, "Failed to recreate queue after rotation");
        }

        debug!(token = %token, bytes = len, "Rotated queue");
        Ok(Some(Batch::new(token, target)))
    }

    fn next_token(&mut self) -> String {
        match self.tokens.generate() {
            Ok(ulid) => ulid.to_string(),
            Err(err) => {
                warn!(error = %err, "ULID generator overflowed; falling back to a fresh ULID");
                Ulid::new().to_string()
            }
        }
    }

    /// Processing files left behind by an earlier run, oldest rotation
    /// first.
    pub fn orphans(&self) -> Result<Vec<Batch>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(DaemonError::io("scan queue dir", err)),
        };

        let mut batches = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| DaemonError::io("scan queue dir", err))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(token) = processing_token(name) {
                batches.push(Batch::new(token.to_string(), entry.path()));
            }
        }

        batches.sort_by(|a, b| a.token.cmp(&b.token));
        Ok(batches)
    }
}

/// One rotated processing file and how far into it we have read.
#[derive(Debug)]
pub struct Batch {
    pub token: String,
    pub path: PathBuf,
    consumed: u64,
    partial: Vec<u8>,
    failures: u32,
}

impl Batch {
    pub fn new(token: String, path: PathBuf) -> Self {
        Self {
            token,
            path,
            consumed: 0,
            partial: Vec::new(),
            failures: 0,
        }
    }

    /// Counts one more failed read and returns the total so far.
    pub fn record_failure(&mut self) -> u32 {
        self.failures += 1;
        self.failures
    }

    /// Reads everything appended since the previous call and returns the
    /// complete lines in file order. A trailing fragment without a newline
    /// is held back until more bytes arrive or [`Batch::take_remainder`].
    ///
    /// On error nothing is consumed, so a retry sees the same bytes.
    pub fn read_new_lines(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut file =
            fs::File::open(&self.path).map_err(|err| DaemonError::io("open batch", err))?;
        file.seek(SeekFrom::Start(self.consumed))
            .map_err(|err| DaemonError::io("seek batch", err))?;
        let mut fresh = Vec::new();
        file.read_to_end(&mut fresh)
            .map_err(|err| DaemonError::io("read batch", err))?;

        if fresh.is_empty() {
            return Ok(Vec::new());
        }
        self.consumed += fresh.len() as u64;

        let mut buffer = std::mem::take(&mut self.partial);
        buffer.extend_from_slice(&fresh);

        let mut lines = Vec::new();
        let mut start = 0;
        for (index, byte) in buffer.iter().enumerate() {
            if *byte == b'\n' {
                lines.push(buffer[start..index].to_vec());
                start = index + 1;
            }
        }
        self.partial = buffer[start..].to_vec();

        Ok(lines)
    }

    /// The final unterminated fragment, once the file has stopped growing.
    pub fn take_remainder(&mut self) -> Option<Vec<u8>> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DaemonError::io("delete batch", err)),
        }
    }
}
