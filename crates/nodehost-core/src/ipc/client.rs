//! IPC client for sending actions to a peer over a Unix socket.

use crate::error::{ErrorCode, HostingError, Result};
use crate::ipc::messages::{Actor, Reply, RequestEnvelope};
use crate::ipc::protocol::{Request, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Total timeout for connecting to the peer (includes retry time).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between connection retry attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout for calls that do not carry their own.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

struct Connection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: BufWriter<tokio::io::WriteHalf<UnixStream>>,
    next_id: u64,
}

/// Client end of an IPC channel.
///
/// Calls are serialized over a single connection, so the client can be
/// shared behind an `Arc`.
pub struct IpcClient {
    path: PathBuf,
    connection: Mutex<Connection>,
}

impl IpcClient {
    /// Connect to the peer listening on `socket_path`.
    ///
    /// The connection is retried every 100ms for up to 10 seconds to allow
    /// the peer time to start listening.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        Self::connect_with_timeout(socket_path, CONNECT_TIMEOUT).await
    }

    /// Like [`connect`](Self::connect) with an explicit retry budget.
    pub async fn connect_with_timeout(socket_path: &Path, connect_timeout: Duration) -> Result<Self> {
        let start = tokio::time::Instant::now();
        tracing::debug!(path = %socket_path.display(), "Connecting to IPC peer");

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match UnixStream::connect(socket_path).await {
                Ok(stream) => {
                    tracing::info!(
                        path = %socket_path.display(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        attempts,
                        "Connected to IPC peer"
                    );
                    let (read_half, write_half) = tokio::io::split(stream);
                    return Ok(Self {
                        path: socket_path.to_path_buf(),
                        connection: Mutex::new(Connection {
                            reader: BufReader::new(read_half),
                            writer: BufWriter::new(write_half),
                            next_id: 1,
                        }),
                    });
                }
                Err(e) => {
                    if start.elapsed() >= connect_timeout {
                        tracing::warn!(
                            path = %socket_path.display(),
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            attempts,
                            error = %e,
                            "IPC connection timeout"
                        );
                        return Err(HostingError::Timeout(connect_timeout));
                    }
                    tracing::trace!(error = %e, attempt = attempts, "Connection attempt failed, retrying...");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Socket path this client is connected to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send a JSON-RPC request and wait for the result.
    pub async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
        self.call_with_timeout(method, params, RPC_TIMEOUT).await
    }

    /// Send a JSON-RPC request, waiting at most `rpc_timeout` for the reply.
    pub async fn call_with_timeout<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
        rpc_timeout: Duration,
    ) -> Result<R> {
        let mut conn = self.connection.lock().await;
        let id = conn.next_id;
        conn.next_id += 1;

        let request = Request::new(id, method, serde_json::to_value(params)?);
        let request_str = serde_json::to_string(&request)?;
        tracing::debug!(method = %method, id, "Sending RPC request");
        tracing::trace!(request = %request_str, "RPC request body");

        conn.writer.write_all(request_str.as_bytes()).await?;
        conn.writer.write_all(b"\n").await?;
        conn.writer.flush().await?;

        let mut response_str = String::new();
        match timeout(rpc_timeout, conn.reader.read_line(&mut response_str)).await {
            Ok(Ok(0)) => {
                tracing::warn!(method = %method, id, "IPC peer closed the connection");
                return Err(HostingError::ObjectClosed);
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(method = %method, id, error = %e, "RPC read error");
                return Err(e.into());
            }
            Err(_) => {
                tracing::warn!(
                    method = %method,
                    id,
                    timeout_ms = rpc_timeout.as_millis() as u64,
                    "RPC response timeout"
                );
                return Err(HostingError::Timeout(rpc_timeout));
            }
        }

        tracing::trace!(response = %response_str.trim(), "RPC response body");

        let response: Response = serde_json::from_str(&response_str)?;
        if response.id != id {
            return Err(HostingError::Rpc {
                code: ErrorCode::OperationFailed,
                message: format!("response id {} does not match request id {id}", response.id),
            });
        }

        if let Some(error) = response.error {
            tracing::debug!(method = %method, id, code = error.code, message = %error.message, "RPC error response");
            return Err(error.into_hosting_error());
        }

        let result = response.result.ok_or_else(|| HostingError::Rpc {
            code: ErrorCode::OperationFailed,
            message: "missing result in response".into(),
        })?;

        tracing::debug!(method = %method, id, "RPC call successful");
        serde_json::from_value(result).map_err(HostingError::from)
    }

    /// Send an action to `actor` and unwrap its [`Reply`].
    ///
    /// The request timeout travels in the envelope; the local wait is the
    /// same timeout.
    pub async fn request<B, R>(&self, actor: Actor, action: &str, body: B, request_timeout: Duration) -> Result<R>
    where
        B: Serialize,
        R: DeserializeOwned + Default,
    {
        let envelope = RequestEnvelope::new(actor, request_timeout, body);
        let reply: Reply<R> = self
            .call_with_timeout(action, envelope, request_timeout)
            .await?;
        reply.into_result()
    }

    /// Check the peer is responsive.
    pub async fn ping(&self) -> Result<()> {
        let _: PingResponse = self.call("ping", serde_json::json!({})).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PingResponse {
    #[allow(dead_code)]
    pong: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        let result = IpcClient::connect_with_timeout(&path, Duration::from_millis(300)).await;
        assert!(matches!(result, Err(HostingError::Timeout(_))));
    }
}
