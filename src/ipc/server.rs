//! Server side of the socket transport: hosts one [`Dispatcher`] on a Unix
//! listener.
//!
//! Each connection gets its own task; requests on one connection are
//! dispatched concurrently and answered in completion order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::RemoteFault;
use crate::ipc::framing::{read_message, write_message};
use crate::ipc::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::proxy::Dispatcher;

/// Bind a listener at `path`, replacing a stale socket file left behind by a
/// previous run.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory {}", parent.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("Failed to bind {}", path.display()))
}

/// Accept connections until the listener fails.
///
/// Connection tasks are owned by this future: dropping or aborting it closes
/// every connection it accepted.
pub async fn serve(listener: UnixListener, dispatcher: Arc<dyn Dispatcher>) -> Result<()> {
    let interface = dispatcher.descriptor().name;
    info!(interface, "serving");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("Failed to accept connection")?;
                debug!(interface, "client connected");
                connections.spawn(serve_connection(stream, Arc::clone(&dispatcher)));
            }
            Some(finished) = connections.join_next() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!(interface, "connection task panicked");
                    }
                }
            }
        }
    }
}

async fn serve_connection(stream: UnixStream, dispatcher: Arc<dyn Dispatcher>) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let writer = Arc::new(Mutex::new(write_half));
    let mut requests = JoinSet::new();

    loop {
        let body = match read_message(&mut reader).await {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(e) => {
                let error = format!("{:#}", e);
                warn!(%error, "dropping connection after framing error");
                break;
            }
        };

        match serde_json::from_str::<JsonRpcRequest>(&body) {
            Ok(request) => {
                let dispatcher = Arc::clone(&dispatcher);
                let writer = Arc::clone(&writer);
                requests.spawn(async move {
                    let id = request.id;
                    let method = request.method.clone();
                    let reply = dispatcher.dispatch(request.into_transaction()).await;
                    debug!(%method, id, "request handled");
                    respond(&writer, JsonRpcResponse::from_reply(id, reply)).await;
                });
            }
            Err(e) => {
                let fault = RemoteFault::new(RemoteFault::PARSE_ERROR, format!("Parse error: {}", e));
                respond(&writer, JsonRpcResponse::error(None, fault)).await;
            }
        }
    }

    // Let in-flight requests finish answering before the write half goes.
    while requests.join_next().await.is_some() {}
    debug!("client disconnected");
}

async fn respond(writer: &Mutex<OwnedWriteHalf>, response: JsonRpcResponse) {
    let body = match serde_json::to_string(&response) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to encode response");
            return;
        }
    };
    let mut writer = writer.lock().await;
    if let Err(e) = write_message(&mut *writer, &body).await {
        debug!(error = %e, "failed to write response");
    }
}

/// A server running in the background.
pub struct ServerHandle {
    path: PathBuf,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting, close every connection and remove the socket file.
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "socket file already gone");
        }
        info!(path = %self.path.display(), "server stopped");
    }
}

/// Bind `path` and serve `dispatcher` on a background task.
pub fn spawn(path: impl Into<PathBuf>, dispatcher: impl Dispatcher) -> Result<ServerHandle> {
    let path = path.into();
    let listener = bind(&path)?;
    let task = tokio::spawn(serve(listener, Arc::new(dispatcher)));
    Ok(ServerHandle { path, task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{MethodId, Reply, Transaction};
    use crate::proxy::InterfaceDescriptor;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    static SUM: InterfaceDescriptor = InterfaceDescriptor {
        name: "sum",
        methods: &[],
    };

    struct Sum;

    #[async_trait]
    impl Dispatcher for Sum {
        fn descriptor(&self) -> &'static InterfaceDescriptor {
            &SUM
        }

        async fn dispatch(&self, transaction: Transaction) -> Reply {
            let total: i64 = transaction.args.iter().filter_map(|v| v.as_i64()).sum();
            Reply::Payload(json!(total))
        }
    }

    fn socket_path(name: &str) -> PathBuf {
        PathBuf::from(format!(
            "/tmp/service-fetcher-{}-{}.sock",
            name,
            std::process::id()
        ))
    }

    async fn exchange(stream: UnixStream, body: &str) -> JsonRpcResponse {
        let (read_half, mut write_half) = stream.into_split();
        write_message(&mut write_half, body).await.unwrap();
        let mut reader = BufReader::new(read_half);
        let reply = timeout(Duration::from_secs(5), read_message(&mut reader))
            .await
            .expect("Test timed out")
            .unwrap()
            .unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_serves_requests() {
        let server = spawn(socket_path("serves"), Sum).unwrap();
        let stream = UnixStream::connect(server.path()).await.unwrap();

        let request = JsonRpcRequest::new(
            Transaction::new(MethodId::new("sum", "all"), vec![json!(1), json!(2), json!(3)]),
            9,
        );
        let response = exchange(stream, &serde_json::to_string(&request).unwrap()).await;
        assert_eq!(response, JsonRpcResponse::success(9, json!(6)));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_garbage_gets_parse_error() {
        let server = spawn(socket_path("garbage"), Sum).unwrap();
        let stream = UnixStream::connect(server.path()).await.unwrap();

        let response = exchange(stream, "not json").await;
        assert_eq!(response.id, None);
        assert_eq!(response.error.unwrap().code, RemoteFault::PARSE_ERROR);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_removes_socket_and_closes_clients() {
        let path = socket_path("shutdown");
        let server = spawn(path.clone(), Sum).unwrap();
        let stream = UnixStream::connect(&path).await.unwrap();
        // Give the accept loop a chance to take the connection.
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown().await;
        assert!(!path.exists());

        let mut reader = BufReader::new(stream);
        let eof = timeout(Duration::from_secs(5), read_message(&mut reader))
            .await
            .expect("Test timed out")
            .unwrap();
        assert_eq!(eof, None);
    }
}
