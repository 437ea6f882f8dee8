//! Client side of the socket transport.
//!
//! [`UnixTransport`] establishes connections for a
//! [`ConnectionManager`](crate::ConnectionManager). Each established
//! connection is wrapped in a binder that multiplexes concurrent transactions
//! by JSON-RPC request id, with a reader task routing replies back to their
//! callers. The reader task is also the death monitor: EOF or a read error is
//! reported as unexpected termination of the handle.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bridge::{Reply, Transaction};
use crate::config::FetcherConfig;
use crate::connection::{BindTarget, ConnectionEvents};
use crate::error::TransportError;
use crate::ipc::framing::{read_message, write_message};
use crate::ipc::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::{Binder, DeathNotifier, Transport, TransportHandle};

/// Default per-transaction reply timeout in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Default number of socket connect tries within one connect attempt.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;

/// Connect with exponential backoff: 100ms, 200ms, 400ms, ...
///
/// # Errors
///
/// Returns the last connection error if every try fails.
pub async fn connect_with_retry(
    socket_path: &Path,
    max_attempts: u32,
) -> Result<UnixStream, TransportError> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < max_attempts => {
                let delay = Duration::from_millis(100 * (1 << (attempt - 1).min(10)));
                debug!(
                    path = %socket_path.display(),
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "connect failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Transport provider for JSON-RPC services on Unix domain sockets.
///
/// Connect attempts run as tasks on the runtime the transport was created
/// with, so the manager may be driven from any thread.
pub struct UnixTransport {
    runtime: Handle,
    connect_attempts: u32,
    call_timeout: Duration,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl UnixTransport {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            in_flight: Mutex::new(None),
        }
    }

    pub fn from_config(runtime: Handle, config: &FetcherConfig) -> Self {
        Self::new(runtime)
            .with_connect_attempts(config.connect_attempts)
            .with_call_timeout(config.call_timeout)
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for UnixTransport {
    fn connect(&self, target: &BindTarget, events: ConnectionEvents) {
        let path = target.endpoint().to_path_buf();
        let attempts = self.connect_attempts;
        let call_timeout = self.call_timeout;
        let runtime = self.runtime.clone();

        let task = self.runtime.spawn(async move {
            match connect_with_retry(&path, attempts).await {
                Ok(stream) => {
                    info!(path = %path.display(), attempt = events.attempt(), "socket connected");
                    events.connected(UnixBinder::start(stream, call_timeout, &runtime));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "socket connect failed");
                    events.connect_failed(e.to_string());
                }
            }
        });

        if let Some(previous) = self.in_flight().replace(task) {
            previous.abort();
        }
    }

    fn disconnect(&self, target: &BindTarget) {
        if let Some(task) = self.in_flight().take() {
            task.abort();
            debug!(target_name = target.name(), "cancelled connect task");
        }
    }
}

type Outcome = Result<Reply, TransportError>;
type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Outcome>>>>;

fn lock_replies(pending: &PendingReplies) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Outcome>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fail every in-flight transaction.
fn fail_pending(pending: &PendingReplies) -> usize {
    let drained: Vec<_> = lock_replies(pending).drain().collect();
    let count = drained.len();
    for (_, tx) in drained {
        let _ = tx.send(Err(TransportError::Closed));
    }
    count
}

/// One live socket connection.
struct UnixBinder {
    writer: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    pending: PendingReplies,
    next_id: AtomicU64,
    call_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
}

impl UnixBinder {
    /// Wrap `stream` in a handle and start its reader task.
    fn start(stream: UnixStream, call_timeout: Duration, runtime: &Handle) -> TransportHandle {
        let (read_half, write_half) = stream.into_split();
        let binder = Arc::new(UnixBinder {
            writer: Arc::new(tokio::sync::Mutex::new(Some(write_half))),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            call_timeout,
            reader: Mutex::new(None),
            runtime: runtime.clone(),
        });
        let handle = TransportHandle::from_shared(binder.clone());

        let task = runtime.spawn(read_loop(
            BufReader::new(read_half),
            Arc::clone(&binder.pending),
            handle.death_notifier(),
        ));
        *binder.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        handle
    }
}

#[async_trait]
impl Binder for UnixBinder {
    async fn transact(&self, transaction: Transaction) -> Result<Reply, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(transaction, id);
        let body = serde_json::to_string(&request).map_err(TransportError::Encode)?;

        let (tx, rx) = oneshot::channel();
        lock_replies(&self.pending).insert(id, tx);

        let sent = match self.writer.lock().await.as_mut() {
            Some(writer) => write_message(writer, &body)
                .await
                .map_err(|e| TransportError::Protocol(format!("Failed to send request: {:#}", e))),
            None => Err(TransportError::Closed),
        };
        if let Err(e) = sent {
            lock_replies(&self.pending).remove(&id);
            return Err(e);
        }

        match timeout(self.call_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                lock_replies(&self.pending).remove(&id);
                Err(TransportError::Timeout(self.call_timeout.as_secs()))
            }
        }
    }

    fn close(&self) {
        if let Some(reader) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take() {
            reader.abort();
        }
        let failed = fail_pending(&self.pending);

        // Dropping the write half is what tells the server we are gone.
        match self.writer.try_lock() {
            Ok(mut writer) => drop(writer.take()),
            Err(_) => {
                let writer = Arc::clone(&self.writer);
                self.runtime.spawn(async move {
                    writer.lock().await.take();
                });
            }
        }
        debug!(failed, "socket binder closed");
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    pending: PendingReplies,
    death: DeathNotifier,
) {
    loop {
        match read_message(&mut reader).await {
            Ok(Some(body)) => match serde_json::from_str::<JsonRpcResponse>(&body) {
                Ok(response) => route_response(&pending, response),
                Err(e) => warn!(error = %e, "discarding unparsable response"),
            },
            Ok(None) => {
                debug!("server closed the connection");
                break;
            }
            Err(e) => {
                let error = format!("{:#}", e);
                warn!(%error, "socket read failed");
                break;
            }
        }
    }

    // Report the death before failing callers, so they see a dead handle.
    if death.notify() {
        info!("socket connection lost");
    }
    fail_pending(&pending);
}

fn route_response(pending: &PendingReplies, response: JsonRpcResponse) {
    let Some(id) = response.id else {
        warn!(error = ?response.error, "response without id");
        return;
    };
    let Some(tx) = lock_replies(pending).remove(&id) else {
        debug!(id, "reply for a request nobody is waiting for");
        return;
    };
    let outcome = response.into_reply().ok_or_else(|| {
        TransportError::Protocol("Response missing both result and error".to_string())
    });
    let _ = tx.send(outcome);
}
