//! IPC server: accepts connections on a Unix socket and dispatches each
//! request line to a [`RequestHandler`].

use crate::error::Result;
use crate::ipc::messages::{Reply, RequestEnvelope};
use crate::ipc::protocol::{error_codes, Request, Response};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Handles one decoded request and produces its response.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

/// Decode an action envelope, run `f`, and wrap its outcome in a [`Reply`].
///
/// Undecodable params produce an `INVALID_PARAMS` error response.
pub async fn handle_action<B, R, F, Fut>(id: u64, method: &str, params: Value, f: F) -> Response
where
    B: DeserializeOwned,
    R: Serialize + Default,
    F: FnOnce(RequestEnvelope<B>) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let envelope = match serde_json::from_value::<RequestEnvelope<B>>(params) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(id, method = %method, error = %e, "invalid action params, dropping");
            return Response::error(
                id,
                error_codes::INVALID_PARAMS,
                format!("invalid params: {e}"),
            );
        }
    };

    trace!(id, method = %method, actor = %envelope.actor, timeout_ticks = envelope.timeout_ticks, "dispatching action");
    let reply = Reply::from_result(f(envelope).await);
    if reply.error != crate::error::ErrorCode::Success {
        debug!(id, method = %method, error = %reply.error, message = %reply.message, "action failed");
    }

    match serde_json::to_value(&reply) {
        Ok(v) => Response::success(id, v),
        Err(e) => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
    }
}

/// A listening IPC endpoint.
pub struct IpcServer {
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    accept_handle: Option<JoinHandle<()>>,
}

impl IpcServer {
    /// Bind `socket_path` and start accepting connections.
    ///
    /// A stale socket file left by a previous process is removed first.
    pub async fn bind(socket_path: &Path, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        if socket_path.exists() {
            tokio::fs::remove_file(socket_path).await?;
            debug!(path = %socket_path.display(), "removed existing socket file");
        }
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "listening for connections");

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_notify = Arc::new(Notify::new());
        let accept_handle = tokio::spawn(Self::accept_loop(
            listener,
            handler,
            Arc::clone(&shutdown),
            Arc::clone(&shutdown_notify),
        ));

        Ok(Self {
            path: socket_path.to_path_buf(),
            shutdown,
            shutdown_notify,
            accept_handle: Some(accept_handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        self.accept_handle.is_some() && !self.shutdown.load(Ordering::Relaxed)
    }

    async fn accept_loop(
        listener: UnixListener,
        handler: Arc<dyn RequestHandler>,
        shutdown: Arc<AtomicBool>,
        shutdown_notify: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_notify.notified() => {
                    debug!("accept loop received shutdown signal");
                    break;
                }

                accepted = listener.accept() => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    match accepted {
                        Ok((stream, _addr)) => {
                            debug!("accepted new connection");
                            let handler = Arc::clone(&handler);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, handler).await {
                                    warn!(error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
            }
        }
    }

    /// Stop accepting connections and remove the socket file.
    pub async fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_one();

        if let Some(handle) = self.accept_handle.take() {
            if let Err(e) = handle.await {
                error!(error = ?e, "accept loop panicked during shutdown");
            }
        }

        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove socket file");
            }
        }
        info!(path = %self.path.display(), "IPC server stopped");
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Some(handle) = self.accept_handle.take() {
            handle.abort();
        }
    }
}

/// Handle a single client connection.
///
/// Reads newline-delimited JSON-RPC requests and writes responses.
async fn handle_connection(stream: UnixStream, handler: Arc<dyn RequestHandler>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            debug!("client disconnected");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        trace!(request = %trimmed, "received request");

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(req) if req.method == "ping" => Response::success(req.id, json!({"pong": true})),
            Ok(req) => handler.handle(req).await,
            Err(e) => {
                warn!(error = %e, "failed to parse request");
                Response::error(0, error_codes::PARSE_ERROR, format!("parse error: {e}"))
            }
        };

        let json = serde_json::to_string(&response)?;
        trace!(response = %json, "sending response");
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}
