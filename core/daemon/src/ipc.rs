//! Unix-socket IPC for UI clients.
//!
//! One JSON request line in, one JSON response line out. `subscribe` is the
//! exception: after the first response the connection stays open and gets
//! one more response line per published snapshot.
//!
//! Reads never touch the store. They are served from the [`SnapshotHandle`];
//! mutations are forwarded to the drain loop as [`Command`]s and answered
//! once the loop replies.

use chrono::{DateTime, Utc};
use eocc_protocol::{
    parse_remove_session, ErrorInfo, Method, Request, Response, Snapshot,
    ERROR_TOO_MANY_CONNECTIONS, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde_json::Value;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::drain::Command;
use crate::publish::{SnapshotHandle, SubscriberHub};

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const COMMAND_TIMEOUT_SECS: u64 = 5;
const SUBSCRIBER_PROBE_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_ACTIVE_CONNECTIONS: usize = 64;

pub struct IpcContext {
    snapshots: SnapshotHandle,
    hub: Arc<SubscriberHub>,
    commands: Sender<Command>,
    queue_file: PathBuf,
    poll_interval: Duration,
    started_at: DateTime<Utc>,
    active_connections: AtomicUsize,
    rejected_connections: AtomicU64,
}

impl IpcContext {
    pub fn new(
        snapshots: SnapshotHandle,
        hub: Arc<SubscriberHub>,
        commands: Sender<Command>,
        queue_file: PathBuf,
        poll_interval: Duration,
    ) -> Self {
        Self {
            snapshots,
            hub,
            commands,
            queue_file,
            poll_interval,
            started_at: Utc::now(),
            active_connections: AtomicUsize::new(0),
            rejected_connections: AtomicU64::new(0),
        }
    }
}

/// Decrements the active-connection count when the handler finishes.
struct ConnectionPermit {
    context: Arc<IpcContext>,
}

impl ConnectionPermit {
    fn acquire(context: &Arc<IpcContext>) -> Option<Self> {
        let acquired = context
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < MAX_ACTIVE_CONNECTIONS).then_some(active + 1)
            })
            .is_ok();
        acquired.then(|| Self {
            context: Arc::clone(context),
        })
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.context
            .active_connections
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// Accept loop; runs until the listener fails for good.
pub fn serve(listener: UnixListener, context: Arc<IpcContext>) {
    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => match ConnectionPermit::acquire(&context) {
                Some(permit) => {
                    let context = Arc::clone(&context);
                    thread::spawn(move || {
                        let _permit = permit;
                        handle_connection(stream, &context);
                    });
                }
                None => {
                    context.rejected_connections.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        max = MAX_ACTIVE_CONNECTIONS,
                        "Rejecting connection: too many active connections"
                    );
                    let response = Response::error(
                        None,
                        ERROR_TOO_MANY_CONNECTIONS,
                        "daemon is at its connection limit",
                    );
                    let _ = write_response(&mut stream, &response);
                }
            },
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn handle_connection(mut stream: UnixStream, context: &IpcContext) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, &response);
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Daemon request received");

    if request.method == Method::Subscribe && request.protocol_version == PROTOCOL_VERSION {
        stream_snapshots(stream, request.id, context);
        return;
    }

    let response = handle_request(request, context);
    let _ = write_response(&mut stream, &response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, context: &IpcContext) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => Response::ok(request.id, health(context)),
        Method::GetSnapshot | Method::Subscribe => {
            snapshot_response(request.id, &context.snapshots.current())
        }
        Method::RemoveSession => {
            let params = match parse_remove_session(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            let (reply, replies) = mpsc::channel();
            let command = Command::RemoveSession {
                key: params.key.clone(),
                reply,
            };
            match dispatch(context, command, replies) {
                Ok(removed) => {
                    info!(key = %params.key, removed, "remove_session");
                    Response::ok(
                        request.id,
                        serde_json::json!({ "key": params.key, "removed": removed }),
                    )
                }
                Err(err) => Response::error_with_info(request.id, err),
            }
        }
        Method::ClearSessions => {
            let (reply, replies) = mpsc::channel();
            match dispatch(context, Command::ClearSessions { reply }, replies) {
                Ok(cleared) => {
                    info!(cleared, "clear_sessions");
                    Response::ok(request.id, serde_json::json!({ "cleared": cleared }))
                }
                Err(err) => Response::error_with_info(request.id, err),
            }
        }
    }
}

fn dispatch<T>(
    context: &IpcContext,
    command: Command,
    replies: mpsc::Receiver<T>,
) -> Result<T, ErrorInfo> {
    context.commands.send(command).map_err(|_| {
        ErrorInfo::new("daemon_unavailable", "drain loop is not accepting commands")
    })?;
    replies
        .recv_timeout(Duration::from_secs(COMMAND_TIMEOUT_SECS))
        .map_err(|_| ErrorInfo::new("daemon_unavailable", "drain loop did not reply"))
}

fn health(context: &IpcContext) -> Value {
    let snapshot = context.snapshots.current();
    let uptime = Utc::now().signed_duration_since(context.started_at);
    serde_json::json!({
        "status": "ok",
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
        "started_at": context.started_at.to_rfc3339(),
        "uptime_secs": uptime.num_seconds(),
        "poll_interval_ms": context.poll_interval.as_millis() as u64,
        "queue_file": context.queue_file.display().to_string(),
        "sessions": snapshot.sessions.len(),
        "waiting_sessions": snapshot.waiting_count(),
        "events": snapshot.events.len(),
        "last_event_at": snapshot.recent_events(1).next().map(|event| event.timestamp.clone()),
        "subscribers": context.hub.subscriber_count(),
        "security": {
            "active_connections": context.active_connections.load(Ordering::Acquire),
            "rejected_connections": context.rejected_connections.load(Ordering::Relaxed),
        },
    })
}

fn snapshot_response(id: Option<String>, snapshot: &Snapshot) -> Response {
    match serde_json::to_value(snapshot) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize snapshot: {}", err),
        ),
    }
}

/// Sends the current snapshot, then every published one, until the client
/// goes away.
fn stream_snapshots(mut stream: UnixStream, id: Option<String>, context: &IpcContext) {
    let updates = context.hub.subscribe();
    let initial = snapshot_response(id.clone(), &context.snapshots.current());
    if write_response(&mut stream, &initial).is_err() {
        return;
    }
    debug!("Subscriber attached");

    loop {
        match updates.recv_timeout(SUBSCRIBER_PROBE_INTERVAL) {
            Ok(snapshot) => {
                let response = snapshot_response(id.clone(), &snapshot);
                if write_response(&mut stream, &response).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if peer_closed(&mut stream) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Subscriber detached");
}

/// Non-blocking EOF probe. Anything the client sends while subscribed is
/// discarded.
fn peer_closed(stream: &mut UnixStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let mut scratch = [0u8; 64];
    let closed = match stream.read(&mut scratch) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) => err.kind() != ErrorKind::WouldBlock,
    };
    closed || stream.set_nonblocking(false).is_err()
}

fn write_response(stream: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
