//! The single-writer drain loop.
//!
//! Every tick: finish any batch left over from a failed cycle, rotate the
//! queue, read the rotated batch until it stops growing, feed each valid
//! line through the store, commit once, and only then delete the consumed
//! processing files. UI commands arrive on the same thread through a
//! channel, so the store never has a second writer.

use eocc_protocol::parse_line;
use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::queue::{Batch, QueueFiles};
use crate::store::StateStore;

/// Failed reads of one batch before it is set aside until the next startup.
const MAX_BATCH_ATTEMPTS: u32 = 5;

pub enum Command {
    RemoveSession { key: String, reply: Sender<bool> },
    ClearSessions { reply: Sender<usize> },
    Shutdown,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub batches: usize,
    pub applied: usize,
    pub skipped: usize,
    pub committed: bool,
}

pub struct DrainLoop {
    files: QueueFiles,
    store: StateStore,
    pending: VecDeque<Batch>,
    poll_interval: Duration,
}

impl DrainLoop {
    pub fn new(files: QueueFiles, store: StateStore, poll_interval: Duration) -> Self {
        Self {
            files,
            store,
            pending: VecDeque::new(),
            poll_interval,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Picks up processing files a previous run left behind. Batches the
    /// persisted snapshot already covers are deleted without replay; the
    /// rest are drained before anything new is rotated.
    pub fn recover(&mut self) -> CycleReport {
        if let Err(err) = self.files.ensure() {
            warn!(error = %err, "Failed to prepare queue directory");
        }

        match self.files.orphans() {
            Ok(orphans) => {
                for batch in orphans {
                    if self.store.is_batch_applied(&batch.token) {
                        info!(token = %batch.token, "Discarding already-applied batch");
                        if let Err(err) = batch.remove() {
                            warn!(error = %err, token = %batch.token, "Failed to delete applied batch");
                        }
                    } else {
                        info!(token = %batch.token, "Replaying orphaned batch");
                        self.pending.push_back(batch);
                    }
                }
            }
            Err(err) => warn!(error = %err, "Failed to scan for orphaned batches"),
        }

        self.run_cycle()
    }

    /// One drain cycle. Filesystem errors abort the cycle; whatever batch
    /// was being read stays pending and is resumed from its offset on the
    /// next tick. A processing file that disappeared counts as fully read.
    /// A batch that keeps failing is dropped from the pending list after
    /// [`MAX_BATCH_ATTEMPTS`] and left on disk for startup recovery.
    pub fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let mut consumed = Vec::new();

        let drained = self.drain_pending(&mut report, &mut consumed).and_then(|()| {
            if let Some(batch) = self.files.rotate()? {
                self.pending.push_back(batch);
                self.drain_pending(&mut report, &mut consumed)?;
            }
            Ok(())
        });
        if let Err(err) = drained {
            warn!(error = %err, "Drain cycle aborted; will retry next tick");
        }

        report.committed = self.store.commit();

        for batch in consumed {
            if let Err(err) = batch.remove() {
                warn!(error = %err, token = %batch.token, "Failed to delete processed batch");
            }
        }

        if report.batches > 0 {
            info!(
                batches = report.batches,
                applied = report.applied,
                skipped = report.skipped,
                committed = report.committed,
                "Drained queue"
            );
        }
        report
    }

    fn drain_pending(&mut self, report: &mut CycleReport, consumed: &mut Vec<Batch>) -> Result<()> {
        while let Some(batch) = self.pending.front_mut() {
            match read_batch(&mut self.store, batch, report) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    warn!(error = %err, token = %batch.token, "Processing file vanished; treating batch as read");
                    if let Some(rest) = batch.take_remainder() {
                        ingest_line(&mut self.store, &batch.token, &rest, report);
                    }
                }
                Err(err) => {
                    let attempts = batch.record_failure();
                    if attempts < MAX_BATCH_ATTEMPTS {
                        return Err(err);
                    }
                    error!(
                        error = %err,
                        token = %batch.token,
                        attempts,
                        "Setting aside unreadable batch until next startup"
                    );
                    self.pending.pop_front();
                    continue;
                }
            }

            if let Some(batch) = self.pending.pop_front() {
                self.store.mark_batch_applied(&batch.token);
                report.batches += 1;
                consumed.push(batch);
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::RemoveSession { key, reply } => {
                let removed = self.store.remove_session(&key);
                debug!(key = %key, removed, "remove_session");
                self.store.commit();
                let _ = reply.send(removed);
            }
            Command::ClearSessions { reply } => {
                let cleared = self.store.clear_sessions();
                debug!(cleared, "clear_sessions");
                self.store.commit();
                let _ = reply.send(cleared);
            }
            Command::Shutdown => {}
        }
    }

    /// Ticks every poll interval and serves commands in between. Returns
    /// the store after a final drain once `Shutdown` arrives or every
    /// command sender is gone.
    pub fn run(mut self, commands: Receiver<Command>) -> StateStore {
        let mut next_tick = Instant::now();
        loop {
            let now = Instant::now();
            if now >= next_tick {
                self.run_cycle();
                next_tick = Instant::now() + self.poll_interval;
                continue;
            }

            match commands.recv_timeout(next_tick - now) {
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(command) => self.handle_command(command),
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        info!("Shutting down; final drain");
        self.run_cycle();
        self.store
    }
}

/// Reads until the file stops growing, then flushes any unterminated tail.
fn read_batch(store: &mut StateStore, batch: &mut Batch, report: &mut CycleReport) -> Result<()> {
    loop {
        let lines = batch.read_new_lines()?;
        if lines.is_empty() {
            break;
        }
        for line in lines {
            ingest_line(store, &batch.token, &line, report);
        }
    }
    if let Some(rest) = batch.take_remainder() {
        ingest_line(store, &batch.token, &rest, report);
    }
    Ok(())
}

fn ingest_line(store: &mut StateStore, token: &str, line: &[u8], report: &mut CycleReport) {
    if line.iter().all(u8::is_ascii_whitespace) {
        return;
    }
    match parse_line(line) {
        Ok(event) => {
            store.apply_event(event);
            report.applied += 1;
        }
        Err(err) => {
            report.skipped += 1;
            warn!(error = %err, token = %token, "Skipping malformed queue line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eocc_protocol::{
        append_event, processing_file_name, Event, EventKind, NotificationType, SessionStatus,
        HISTORY_CAPACITY, QUEUE_FILE_NAME,
    };
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::mpsc;
    use std::thread;

    struct Fixture {
        _dir: tempfile::TempDir,
        queue_file: PathBuf,
        snapshot_path: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("temp dir");
            let queue_file = dir.path().join("logs").join(QUEUE_FILE_NAME);
            let snapshot_path = dir.path().join("runtime_state.json");
            Self {
                _dir: dir,
                queue_file,
                snapshot_path,
            }
        }

        fn queue_dir(&self) -> &Path {
            self.queue_file.parent().expect("queue dir")
        }

        fn drain_loop(&self) -> DrainLoop {
            let store = StateStore::load(&self.snapshot_path, HISTORY_CAPACITY);
            DrainLoop::new(
                QueueFiles::new(&self.queue_file),
                store,
                Duration::from_millis(20),
            )
        }

        fn append(&self, event: &Event) {
            append_event(&self.queue_file, event).expect("append event");
        }

        fn append_raw(&self, bytes: &[u8]) {
            std::fs::create_dir_all(self.queue_dir()).expect("queue dir");
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.queue_file)
                .expect("open queue");
            file.write_all(bytes).expect("append raw");
        }

        fn processing_files(&self) -> Vec<PathBuf> {
            std::fs::read_dir(self.queue_dir())
                .expect("read queue dir")
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.starts_with("events.processing."))
                })
                .collect()
        }
    }

    fn event(kind: EventKind, dir: &str, timestamp: &str) -> Event {
        Event {
            timestamp: timestamp.to_string(),
            kind,
            project_name: dir.rsplit('/').next().unwrap_or(dir).to_string(),
            project_dir: dir.to_string(),
            session_id: "s-1".to_string(),
            ..Default::default()
        }
    }

    fn permission(dir: &str, timestamp: &str, message: &str) -> Event {
        Event {
            notification_type: NotificationType::PermissionPrompt,
            message: message.to_string(),
            ..event(EventKind::Notification, dir, timestamp)
        }
    }

    #[test]
    fn idle_cycle_does_nothing() {
        let fixture = Fixture::new();
        let mut drain = fixture.drain_loop();

        let report = drain.run_cycle();
        assert_eq!(report, CycleReport::default());
        assert!(fixture.queue_file.exists());
        assert!(!fixture.snapshot_path.exists());
    }

    #[test]
    fn cycle_applies_events_and_cleans_up() {
        let fixture = Fixture::new();
        let mut drain = fixture.drain_loop();
        fixture.append(&event(EventKind::SessionStart, "/work/api", "t1"));
        fixture.append(&permission("/work/api", "t2", "Allow Bash?\nrm -rf build"));

        let report = drain.run_cycle();
        assert_eq!(report.batches, 1);
        assert_eq!(report.applied, 2);
        assert!(report.committed);

        let session = drain.store().session("/work/api").expect("session");
        assert_eq!(session.status, SessionStatus::WaitingPermission);
        assert_eq!(session.waiting_for, "Allow Bash?");
        assert!(fixture.processing_files().is_empty());
        assert_eq!(std::fs::metadata(&fixture.queue_file).expect("queue").len(), 0);
        assert!(fixture.snapshot_path.exists());
    }

    #[test]
    fn malformed_line_is_skipped_between_valid_ones() {
        let fixture = Fixture::new();
        let mut drain = fixture.drain_loop();
        fixture.append(&event(EventKind::SessionStart, "/work/api", "t1"));
        fixture.append_raw(b"{not json\n\n[1,2]\n{\"event\":\"stop\"}\n");
        fixture.append(&event(EventKind::Stop, "/work/api", "t3"));

        let report = drain.run_cycle();
        assert_eq!(report.applied, 2);
        assert_eq!(report.skipped, 3);

        let session = drain.store().session("/work/api").expect("session");
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.last_event, "t3");
    }

    #[test]
    fn unterminated_final_line_is_still_applied() {
        let fixture = Fixture::new();
        let mut drain = fixture.drain_loop();
        fixture.append_raw(
            br#"{"timestamp":"t1","event":"session_start","project_name":"api","project_dir":"/work/api"}"#,
        );

        let report = drain.run_cycle();
        assert_eq!(report.applied, 1);
        assert!(drain.store().session("/work/api").is_some());
    }

    #[test]
    fn state_survives_restart_with_empty_queue() {
        let fixture = Fixture::new();
        {
            let mut drain = fixture.drain_loop();
            fixture.append(&event(EventKind::SessionStart, "/work/api", "t1"));
            fixture.append(&event(EventKind::SessionStart, "/work/web", "t2"));
            drain.run_cycle();
        }

        let mut restarted = fixture.drain_loop();
        let report = restarted.recover();
        assert_eq!(report.batches, 0);
        assert_eq!(restarted.store().session_count(), 2);
        assert_eq!(restarted.store().history().len(), 2);
    }

    #[test]
    fn crash_between_rotation_and_apply_replays_orphan() {
        let fixture = Fixture::new();
        fixture.append(&event(EventKind::SessionStart, "/work/api", "t1"));
        fixture.append(&permission("/work/api", "t2", "Allow edit?"));

        // Rotate, then "crash" before anything is applied.
        let mut files = QueueFiles::new(&fixture.queue_file);
        let orphan = files.rotate().expect("rotate").expect("batch");
        assert!(orphan.path.exists());

        let mut restarted = fixture.drain_loop();
        let report = restarted.recover();
        assert_eq!(report.batches, 1);
        assert_eq!(report.applied, 2);
        assert_eq!(
            restarted.store().session("/work/api").map(|s| s.status),
            Some(SessionStatus::WaitingPermission)
        );
        assert!(fixture.processing_files().is_empty());
    }

    #[test]
    fn partially_applied_batch_replays_in_full_after_crash() {
        let fixture = Fixture::new();
        fixture.append(&event(EventKind::SessionStart, "/work/api", "t1"));
        fixture.append(&permission("/work/api", "t2", "Allow edit?"));

        let mut files = QueueFiles::new(&fixture.queue_file);
        let mut batch = files.rotate().expect("rotate").expect("batch");
        let lines = batch.read_new_lines().expect("read");
        assert_eq!(lines.len(), 2);

        // First line applied and persisted, then the process dies before the
        // batch token is recorded.
        {
            let mut drain = fixture.drain_loop();
            let mut report = CycleReport::default();
            ingest_line(&mut drain.store, &batch.token, &lines[0], &mut report);
            assert!(drain.store.commit());
        }
        assert!(batch.path.exists());

        let mut restarted = fixture.drain_loop();
        assert_eq!(restarted.store().history().len(), 1);
        let report = restarted.recover();
        assert_eq!(report.batches, 1);
        assert_eq!(report.applied, 2);

        let timestamps: Vec<&str> = restarted
            .store()
            .history()
            .iter()
            .map(|event| event.timestamp.as_str())
            .collect();
        assert_eq!(timestamps, vec!["t1", "t1", "t2"]);
        assert_eq!(
            restarted.store().session("/work/api").map(|s| s.status),
            Some(SessionStatus::WaitingPermission)
        );
        assert!(fixture.processing_files().is_empty());
    }

    #[test]
    fn vanished_pending_batch_does_not_block_new_events() {
        let fixture = Fixture::new();
        let mut drain = fixture.drain_loop();
        let token = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
        drain.pending.push_back(Batch::new(
            token.to_string(),
            fixture.queue_dir().join(processing_file_name(token)),
        ));
        fixture.append(&event(EventKind::SessionStart, "/work/api", "t1"));

        let report = drain.run_cycle();
        assert_eq!(report.batches, 2);
        assert_eq!(report.applied, 1);
        assert!(drain.pending.is_empty());
        assert!(drain.store().session("/work/api").is_some());
        assert!(drain.store().is_batch_applied(token));
        assert!(fixture.processing_files().is_empty());
    }

    #[test]
    fn unreadable_batch_is_set_aside_after_repeated_failures() {
        let fixture = Fixture::new();
        let mut drain = fixture.drain_loop();
        let token = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
        // A directory opens fine but every read fails.
        let unreadable = fixture.queue_dir().join(processing_file_name(token));
        std::fs::create_dir_all(&unreadable).expect("create unreadable batch");
        drain
            .pending
            .push_back(Batch::new(token.to_string(), unreadable.clone()));
        fixture.append(&event(EventKind::SessionStart, "/work/api", "t1"));

        for _ in 1..MAX_BATCH_ATTEMPTS {
            let report = drain.run_cycle();
            assert_eq!(report.applied, 0);
            assert_eq!(drain.pending.len(), 1);
        }

        let report = drain.run_cycle();
        assert_eq!(report.batches, 1);
        assert_eq!(report.applied, 1);
        assert!(drain.pending.is_empty());
        assert!(drain.store().session("/work/api").is_some());
        assert!(!drain.store().is_batch_applied(token));
        assert!(unreadable.exists());
    }

    #[test]
    fn orphan_already_in_snapshot_is_not_replayed() {
        let fixture = Fixture::new();
        fixture.append(&event(EventKind::SessionStart, "/work/api", "t1"));
        fixture.drain_loop().run_cycle();

        // Simulate a crash after commit but before delete: the applied
        // token is in the snapshot and its file is still on disk.
        let applied = crate::persist::load_snapshot(&fixture.snapshot_path)
            .expect("snapshot")
            .applied_batches;
        let leftover = fixture
            .queue_dir()
            .join(processing_file_name(applied.last().expect("token")));
        std::fs::write(
            &leftover,
            format!(
                "{}\n",
                serde_json::to_string(&event(EventKind::Stop, "/work/api", "t9")).expect("json")
            ),
        )
        .expect("write leftover");

        let mut restarted = fixture.drain_loop();
        let report = restarted.recover();
        assert_eq!(report.applied, 0);
        assert!(!leftover.exists());
        assert_eq!(
            restarted.store().session("/work/api").map(|s| s.status),
            Some(SessionStatus::Active)
        );
        assert_eq!(restarted.store().history().len(), 1);
    }

    #[test]
    fn orphans_replay_before_new_queue_content() {
        let fixture = Fixture::new();
        let mut files = QueueFiles::new(&fixture.queue_file);
        fixture.append(&event(EventKind::SessionStart, "/work/api", "t1"));
        files.rotate().expect("rotate").expect("first orphan");
        fixture.append(&permission("/work/api", "t2", "Allow?"));
        files.rotate().expect("rotate").expect("second orphan");
        fixture.append(&event(EventKind::Stop, "/work/api", "t3"));

        let mut drain = fixture.drain_loop();
        let report = drain.recover();
        assert_eq!(report.batches, 3);
        assert_eq!(report.applied, 3);

        let timestamps: Vec<&str> = drain
            .store()
            .history()
            .iter()
            .map(|event| event.timestamp.as_str())
            .collect();
        assert_eq!(timestamps, vec!["t1", "t2", "t3"]);
        assert_eq!(
            drain.store().session("/work/api").map(|s| s.status),
            Some(SessionStatus::Completed)
        );
    }

    #[test]
    fn concurrent_appenders_lose_nothing_across_rotations() {
        let fixture = Fixture::new();
        let mut drain = fixture.drain_loop();
        drain.recover();

        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let queue_file = fixture.queue_file.clone();
                thread::spawn(move || {
                    for index in 0..25 {
                        let dir = format!("/work/p{writer}");
                        let timestamp = format!("w{writer}-{index:02}");
                        append_event(&queue_file, &event(EventKind::UserPromptSubmit, &dir, &timestamp))
                            .expect("append");
                    }
                })
            })
            .collect();

        let mut applied = 0;
        while writers.iter().any(|writer| !writer.is_finished()) {
            applied += drain.run_cycle().applied;
        }
        for writer in writers {
            writer.join().expect("writer thread");
        }
        applied += drain.run_cycle().applied;

        assert_eq!(applied, 100);
        assert!(fixture.processing_files().is_empty());
    }

    #[test]
    fn per_writer_order_is_preserved() {
        let fixture = Fixture::new();
        let mut drain = fixture.drain_loop();
        let mut written = Vec::new();
        for index in 0..10 {
            let timestamp = format!("t{index:02}");
            fixture.append(&event(EventKind::UserPromptSubmit, "/work/api", &timestamp));
            written.push(timestamp);
            if index % 3 == 0 {
                drain.run_cycle();
            }
        }
        drain.run_cycle();

        let seen: Vec<String> = drain
            .store()
            .history()
            .iter()
            .map(|event| event.timestamp.clone())
            .collect();
        assert_eq!(seen, written);
    }

    #[test]
    fn run_serves_commands_and_drains_on_shutdown() {
        let fixture = Fixture::new();
        fixture.append(&event(EventKind::SessionStart, "/work/api", "t1"));
        fixture.append(&event(EventKind::SessionStart, "/work/web", "t2"));

        let drain = fixture.drain_loop();
        let (tx, rx) = mpsc::channel();
        let worker = thread::spawn(move || drain.run(rx));

        let (reply_tx, reply_rx) = mpsc::channel();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut removed = false;
        while Instant::now() < deadline && !removed {
            tx.send(Command::RemoveSession {
                key: "/work/api".to_string(),
                reply: reply_tx.clone(),
            })
            .expect("send command");
            removed = reply_rx.recv().expect("reply");
            if !removed {
                thread::sleep(Duration::from_millis(10));
            }
        }
        assert!(removed);

        fixture.append(&event(EventKind::Stop, "/work/web", "t3"));
        tx.send(Command::Shutdown).expect("shutdown");
        let store = worker.join().expect("drain thread");

        assert!(store.session("/work/api").is_none());
        assert_eq!(
            store.session("/work/web").map(|s| s.status),
            Some(SessionStatus::Completed)
        );
    }

    #[test]
    fn clear_command_replies_with_count() {
        let fixture = Fixture::new();
        let mut drain = fixture.drain_loop();
        fixture.append(&event(EventKind::SessionStart, "/work/api", "t1"));
        fixture.append(&event(EventKind::SessionStart, "/work/web", "t2"));
        drain.run_cycle();

        let (reply_tx, reply_rx) = mpsc::channel();
        drain.handle_command(Command::ClearSessions { reply: reply_tx });
        assert_eq!(reply_rx.recv().expect("reply"), 2);
        assert_eq!(drain.store().session_count(), 0);
        assert_eq!(drain.store().history().len(), 2);
    }
}
