//! Stdio tool service — spawns a tool-server subprocess and exchanges
//! JSON-RPC 2.0 messages over its stdin/stdout.
//!
//! This is the production [`ToolService`]; the supervisor itself never
//! names it and works purely through the [`ServiceFactory`] seam.

use crate::config::ServerDescriptor;
use crate::protocol::{
    InitializeResult, JsonRpcRequest, JsonRpcResponse, ResourceDescriptor, ToolCallResult,
    ToolDescriptor,
};
use crate::service::{ServiceFactory, TerminationSink, ToolService};
use async_trait::async_trait;
use mooring_core::{MooringError, MooringResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The MCP protocol revision this client speaks.
const PROTOCOL_VERSION: &str = "2024-11-05";

type PendingMap = Arc<AsyncMutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Live plumbing for a connected subprocess.
struct Wiring {
    stdin: Arc<AsyncMutex<tokio::process::ChildStdin>>,
    /// Consumed by [`StdioService::disconnect`]; signals the exit watcher
    /// to kill the child without reporting a termination.
    kill_tx: oneshot::Sender<()>,
}

/// A [`ToolService`] over a spawned subprocess.
///
/// Constructed not-yet-connected; `connect` spawns the process, wires the
/// reader and exit-watcher tasks, and performs the initialize handshake.
pub struct StdioService {
    descriptor: ServerDescriptor,
    wiring: Mutex<Option<Wiring>>,
    sink: Arc<Mutex<Option<TerminationSink>>>,
    pending: PendingMap,
    next_id: AtomicU64,
}

impl StdioService {
    /// Creates an unconnected service for `descriptor`.
    pub fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor,
            wiring: Mutex::new(None),
            sink: Arc::new(Mutex::new(None)),
            pending: Arc::new(AsyncMutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> MooringResult<JsonRpcResponse> {
        let stdin = {
            let wiring = self.wiring.lock();
            wiring.as_ref().map(|w| Arc::clone(&w.stdin))
        }
        .ok_or_else(|| MooringError::NotConnected(self.descriptor.name.clone()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let msg = serde_json::to_string(&req)?;
        {
            let mut stdin = stdin.lock().await;
            stdin
                .write_all(msg.as_bytes())
                .await
                .map_err(|e| MooringError::Protocol(format!("Failed to write request: {e}")))?;
            stdin
                .write_all(b"\n")
                .await
                .map_err(|e| MooringError::Protocol(format!("Failed to write newline: {e}")))?;
            stdin
                .flush()
                .await
                .map_err(|e| MooringError::Protocol(format!("Failed to flush stdin: {e}")))?;
        }

        let resp = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => {
                return Err(MooringError::Protocol(format!(
                    "Request '{method}' dropped: server went away"
                )));
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(MooringError::Protocol(format!(
                    "Request '{method}' timed out"
                )));
            }
        };

        if let Some(err) = &resp.error {
            return Err(MooringError::Protocol(format!(
                "Server error {}: {}",
                err.code, err.message
            )));
        }

        Ok(resp)
    }

    /// Send a JSON-RPC notification (no response expected).
    async fn notify_server(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> MooringResult<()> {
        let stdin = {
            let wiring = self.wiring.lock();
            wiring.as_ref().map(|w| Arc::clone(&w.stdin))
        }
        .ok_or_else(|| MooringError::NotConnected(self.descriptor.name.clone()))?;

        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or(serde_json::json!({})),
        });
        let serialized = serde_json::to_string(&msg)?;

        let mut stdin = stdin.lock().await;
        stdin
            .write_all(serialized.as_bytes())
            .await
            .map_err(|e| MooringError::Protocol(format!("Failed to write notification: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| MooringError::Protocol(format!("Failed to write newline: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| MooringError::Protocol(format!("Failed to flush stdin: {e}")))?;
        Ok(())
    }

    /// Perform the initialize handshake.
    async fn initialize(&self) -> MooringResult<InitializeResult> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "mooring",
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let resp = self.request("initialize", Some(params)).await?;
        let result: InitializeResult = serde_json::from_value(
            resp.result
                .ok_or_else(|| MooringError::Protocol("Empty initialize result".into()))?,
        )?;
        Ok(result)
    }
}

#[async_trait]
impl ToolService for StdioService {
    async fn connect(&self) -> MooringResult<()> {
        let name = self.descriptor.name.clone();

        let mut cmd = Command::new(&self.descriptor.command);
        cmd.args(&self.descriptor.args)
            .envs(&self.descriptor.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            MooringError::ConnectionFailed(format!(
                "Failed to spawn '{}': {e}",
                self.descriptor.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MooringError::ConnectionFailed("Server stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MooringError::ConnectionFailed("Server stdout not available".into()))?;

        // Reader task: resolve pending requests from stdout lines.
        let pending = Arc::clone(&self.pending);
        let reader_name = name.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!(server = %reader_name, "Server stdout closed");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                            Ok(resp) => {
                                if let Some(id) = resp.id {
                                    let mut map = pending.lock().await;
                                    if let Some(tx) = map.remove(&id) {
                                        let _ = tx.send(resp);
                                    }
                                }
                                // Server-initiated notifications carry no id
                                // and are ignored.
                            }
                            Err(e) => {
                                debug!(
                                    server = %reader_name,
                                    line = %trimmed,
                                    error = %e,
                                    "Non-JSON-RPC line from server"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        error!(server = %reader_name, error = %e, "Error reading server stdout");
                        break;
                    }
                }
            }
            // Fail any requests still waiting; the process is gone.
            pending.lock().await.clear();
        });

        // Exit watcher: report unexpected death through the sink, stay
        // silent for deliberate disconnects.
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let sink = Arc::clone(&self.sink);
        let watcher_name = name.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let detail = match status {
                        Ok(status) => format!("process exited: {status}"),
                        Err(e) => format!("wait failed: {e}"),
                    };
                    warn!(server = %watcher_name, detail = %detail, "Server process terminated");
                    let sink = sink.lock().clone();
                    if let Some(sink) = sink {
                        sink.notify(Some(detail));
                    }
                }
                _ = kill_rx => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    debug!(server = %watcher_name, "Server process stopped");
                }
            }
        });

        *self.wiring.lock() = Some(Wiring {
            stdin: Arc::new(AsyncMutex::new(stdin)),
            kill_tx,
        });

        let init = self
            .initialize()
            .await
            .map_err(|e| MooringError::ConnectionFailed(format!("Handshake with '{name}' failed: {e}")))?;
        info!(
            server = %name,
            version = %init.protocol_version,
            "Server initialized"
        );
        self.notify_server("notifications/initialized", None)
            .await
            .map_err(|e| MooringError::ConnectionFailed(e.to_string()))?;

        Ok(())
    }

    fn disconnect(&self) {
        let wiring = self.wiring.lock().take();
        if let Some(wiring) = wiring {
            // Watcher kills and reaps the child; a dropped receiver means
            // the process already exited on its own.
            let _ = wiring.kill_tx.send(());
            debug!(server = %self.descriptor.name, "Disconnected");
        }
    }

    async fn list_tools(&self) -> MooringResult<Vec<ToolDescriptor>> {
        let resp = self.request("tools/list", None).await?;
        let result = resp
            .result
            .ok_or_else(|| MooringError::Protocol("Empty tools/list result".into()))?;
        let tools: Vec<ToolDescriptor> = serde_json::from_value(
            result
                .get("tools")
                .cloned()
                .unwrap_or(serde_json::json!([])),
        )?;
        Ok(tools)
    }

    async fn list_resources(&self) -> MooringResult<Vec<ResourceDescriptor>> {
        let resp = self.request("resources/list", None).await?;
        let result = resp
            .result
            .ok_or_else(|| MooringError::Protocol("Empty resources/list result".into()))?;
        let resources: Vec<ResourceDescriptor> = serde_json::from_value(
            result
                .get("resources")
                .cloned()
                .unwrap_or(serde_json::json!([])),
        )?;
        Ok(resources)
    }

    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> MooringResult<String> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let resp = self.request("tools/call", Some(params)).await?;
        let result = resp
            .result
            .ok_or_else(|| MooringError::Protocol("Empty tools/call result".into()))?;
        let call_result: ToolCallResult = serde_json::from_value(result)?;

        let text: String = call_result
            .content
            .iter()
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        if call_result.is_error {
            return Err(MooringError::Tool(text));
        }
        Ok(text)
    }

    fn set_termination_sink(&self, sink: TerminationSink) {
        *self.sink.lock() = Some(sink);
    }
}

/// A [`ServiceFactory`] producing [`StdioService`] handles.
pub fn stdio_factory() -> ServiceFactory {
    Arc::new(|descriptor: &ServerDescriptor| {
        Arc::new(StdioService::new(descriptor.clone())) as Arc<dyn ToolService>
    })
}
