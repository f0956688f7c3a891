//! Connection to one capability provider over the Model Context Protocol.
//!
//! Messages are JSON-RPC 2.0 objects, one per line, exchanged over a
//! bidirectional byte stream (the provider's stdio in production, an
//! in-memory pipe in tests). One request is in flight per connection at a
//! time: the session sits behind an async mutex held for the whole
//! request/response exchange, and anything read that is not the awaited
//! response (notifications, late replies to abandoned requests) is skipped.

use crate::config::ProviderConfig;
use crate::error::GatewayError;
use freya_types::{Arguments, ToolDescriptor};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

/// MCP protocol revision sent in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Upper bound on a single message from a provider.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
const CANCEL_TIMEOUT: Duration = Duration::from_secs(1);
/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Both halves of an open provider stream, plus the child process if the
/// transport spawned one.
pub struct TransportChannel {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    child: Option<Child>,
}

impl TransportChannel {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }

    /// Ties the channel to `child`, which is killed when the channel is
    /// closed or dropped.
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }
}

/// Opens the byte stream to a provider.
pub trait ProviderTransport: Send + Sync {
    fn open(&self) -> BoxFuture<'_, io::Result<TransportChannel>>;
}

/// Launches the provider as a child process and talks to it over stdio.
#[derive(Debug, Clone)]
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl StdioTransport {
    pub fn new(command: impl Into<String>, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            command: command.into(),
            args,
            env,
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone(), config.env.clone())
    }
}

impl ProviderTransport for StdioTransport {
    fn open(&self) -> BoxFuture<'_, io::Result<TransportChannel>> {
        Box::pin(async move {
            let mut command = Command::new(&self.command);
            command
                .args(&self.args)
                .envs(&self.env)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                // Providers log to stderr; let it through to ours.
                .stderr(Stdio::inherit())
                .kill_on_drop(true);

            let mut child = command.spawn()?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "provider stdin unavailable"))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "provider stdout unavailable"))?;

            tracing::debug!(command = %self.command, pid = ?child.id(), "provider process spawned");
            Ok(TransportChannel::new(stdout, stdin).with_child(child))
        })
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

/// Any message a provider may send: response, notification or request.
#[derive(Debug, Deserialize)]
struct JsonRpcMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ToolsPage {
    #[serde(default)]
    tools: Vec<ListedTool>,
    #[serde(rename = "nextCursor", default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    input_schema: Option<Value>,
}

enum CallError {
    /// The stream failed; the session is unusable.
    Io(io::Error),
    /// The deadline passed. `sent` is false if the request line may have
    /// been only partially written.
    TimedOut { id: u64, sent: bool },
    Remote(JsonRpcError),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "transport error: {e}"),
            Self::TimedOut { .. } => f.write_str("timed out"),
            Self::Remote(e) => write!(f, "{} (code {})", e.message, e.code),
        }
    }
}

struct Session {
    provider_id: String,
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    child: Option<Child>,
    // Bytes of a line not yet terminated, kept across cancelled reads.
    partial: Vec<u8>,
    next_id: u64,
}

impl Session {
    fn new(provider_id: &str, channel: TransportChannel) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            reader: BufReader::new(channel.reader),
            writer: channel.writer,
            child: channel.child,
            partial: Vec::new(),
            next_id: 1,
        }
    }

    async fn write_message<T: Serialize>(&mut self, message: &T) -> io::Result<()> {
        let mut line = serde_json::to_vec(message).map_err(io::Error::other)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await
    }

    async fn notify(&mut self, method: &str, params: Option<Value>) -> io::Result<()> {
        self.write_message(&JsonRpcNotification {
            jsonrpc: "2.0",
            method,
            params,
        })
        .await
    }

    /// Reads one newline-terminated message. Cancel-safe: bytes of an
    /// unfinished line stay in `partial`.
    async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "provider closed the connection",
                ));
            }
            let (chunk, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (&available[..pos], Some(pos + 1)),
                None => (available, None),
            };
            if self.partial.len() + chunk.len() > MAX_MESSAGE_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("provider message exceeds {MAX_MESSAGE_BYTES} bytes"),
                ));
            }
            self.partial.extend_from_slice(chunk);
            let consumed = complete.unwrap_or(chunk.len());
            self.reader.consume(consumed);
            if complete.is_some() {
                return Ok(std::mem::take(&mut self.partial));
            }
        }
    }

    async fn read_response(&mut self, id: u64) -> io::Result<Result<Value, JsonRpcError>> {
        loop {
            let line = self.read_line().await?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let message: JsonRpcMessage = match serde_json::from_slice(&line) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(provider = %self.provider_id, error = %e, "skipping unparseable provider message");
                    continue;
                }
            };

            if let Some(method) = &message.method {
                tracing::debug!(provider = %self.provider_id, method = %method, "skipping provider-initiated message");
                continue;
            }
            match message.id.as_ref().and_then(Value::as_u64) {
                Some(got) if got == id => {
                    return Ok(match message.error {
                        Some(error) => Err(error),
                        None => Ok(message.result.unwrap_or(Value::Null)),
                    });
                }
                other => {
                    tracing::debug!(provider = %self.provider_id, expected = id, got = ?other, "skipping stale response");
                }
            }
        }
    }

    async fn call(&mut self, method: &str, params: Value, deadline: Instant) -> Result<Value, CallError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        let mut sent = false;
        let exchange = async {
            self.write_message(&request).await?;
            sent = true;
            self.read_response(id).await
        };
        let outcome = tokio::time::timeout_at(deadline, exchange).await;

        match outcome {
            Err(_) => Err(CallError::TimedOut { id, sent }),
            Ok(Err(e)) => Err(CallError::Io(e)),
            Ok(Ok(Err(remote))) => Err(CallError::Remote(remote)),
            Ok(Ok(Ok(result))) => Ok(result),
        }
    }

    async fn close(mut self) {
        let _ = self.writer.shutdown().await;
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.kill()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(provider = %self.provider_id, error = %e, "provider process already gone");
                }
                Err(_) => {
                    tracing::warn!(provider = %self.provider_id, "provider process did not exit in time");
                }
            }
        }
    }
}

/// A live (or reconnectable) connection to one capability provider.
pub struct ProviderConnection {
    provider_id: String,
    transport: Box<dyn ProviderTransport>,
    session: Mutex<Option<Session>>,
    tools: RwLock<HashMap<String, ToolDescriptor>>,
    connected: AtomicBool,
}

impl std::fmt::Debug for ProviderConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConnection")
            .field("provider_id", &self.provider_id)
            .field("connected", &self.is_connected())
            .field("tools", &self.tool_count())
            .finish()
    }
}

impl ProviderConnection {
    pub fn new(provider_id: impl Into<String>, transport: impl ProviderTransport + 'static) -> Self {
        Self {
            provider_id: provider_id.into(),
            transport: Box::new(transport),
            session: Mutex::new(None),
            tools: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
        }
    }

    /// Builds a connection that launches `config.command` over stdio.
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(config.provider_id.clone(), StdioTransport::from_config(config))
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn tools_read(&self) -> RwLockReadGuard<'_, HashMap<String, ToolDescriptor>> {
        self.tools.read().unwrap_or_else(|poisoned| {
            tracing::error!(provider = %self.provider_id, "tool catalogue lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn tools_write(&self) -> RwLockWriteGuard<'_, HashMap<String, ToolDescriptor>> {
        self.tools.write().unwrap_or_else(|poisoned| {
            tracing::error!(provider = %self.provider_id, "tool catalogue lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// The last-discovered catalogue, sorted by tool name.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<_> = self.tools_read().values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools_read().contains_key(name)
    }

    pub fn tool_count(&self) -> usize {
        self.tools_read().len()
    }

    /// Opens the transport and performs the `initialize` handshake.
    /// Does nothing if already connected.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connection`] if the transport cannot be opened
    /// or the handshake fails. No retry is attempted.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        tracing::info!(provider = %self.provider_id, "connecting to provider");
        let channel = self
            .transport
            .open()
            .await
            .map_err(|e| self.connection_error(format!("failed to open transport: {e}")))?;
        let mut session = Session::new(&self.provider_id, channel);

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "freya",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let init = match session.call("initialize", params, deadline).await {
            Ok(init) => init,
            Err(e) => {
                session.close().await;
                return Err(self.connection_error(format!("initialize failed: {e}")));
            }
        };
        if let Err(e) = session.notify("notifications/initialized", None).await {
            session.close().await;
            return Err(self.connection_error(format!("initialized notification failed: {e}")));
        }

        tracing::info!(
            provider = %self.provider_id,
            server = init.pointer("/serverInfo/name").and_then(|v| v.as_str()).unwrap_or("unknown"),
            protocol = init.get("protocolVersion").and_then(|v| v.as_str()).unwrap_or("unknown"),
            "provider connected"
        );
        *slot = Some(session);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn connection_error(&self, reason: String) -> GatewayError {
        tracing::error!(provider = %self.provider_id, %reason, "provider connection failed");
        GatewayError::Connection {
            provider_id: self.provider_id.clone(),
            reason,
        }
    }

    fn discovery_error(&self, reason: String) -> GatewayError {
        tracing::error!(provider = %self.provider_id, %reason, "tool discovery failed");
        GatewayError::Discovery {
            provider_id: self.provider_id.clone(),
            reason,
        }
    }

    /// Lists the provider's tools (following pagination) and replaces the
    /// catalogue with the result.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::NotConnected`] before [`ProviderConnection::connect`].
    /// - [`GatewayError::Discovery`] if the provider is unreachable or
    ///   returns a malformed listing. The previous catalogue is kept.
    pub async fn discover_tools(&self) -> Result<Vec<ToolDescriptor>, GatewayError> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return Err(GatewayError::NotConnected(self.provider_id.clone()));
        };

        let deadline = Instant::now() + DISCOVERY_TIMEOUT;
        let mut discovered = Vec::new();
        let mut cursor: Option<String> = None;
        let failure = loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let page = match session.call("tools/list", params, deadline).await {
                Ok(page) => page,
                Err(e) => break Some(e),
            };
            let page: ToolsPage = match serde_json::from_value(page) {
                Ok(page) => page,
                Err(e) => {
                    return Err(self.discovery_error(format!("malformed tools/list result: {e}")));
                }
            };

            discovered.extend(page.tools.into_iter().map(|tool| ToolDescriptor {
                name: tool.name,
                description: tool.description.unwrap_or_default(),
                input_schema: tool
                    .input_schema
                    .unwrap_or_else(|| json!({ "type": "object" })),
                provider_id: self.provider_id.clone(),
            }));

            match page.next_cursor.filter(|next| !next.is_empty()) {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(self.discovery_error(format!("pagination cursor {next:?} repeated")));
                }
                Some(next) => cursor = Some(next),
                None => break None,
            }
        };

        if let Some(e) = failure {
            if !matches!(e, CallError::Remote(_) | CallError::TimedOut { sent: true, .. }) {
                self.drop_session(&mut slot, &e);
            }
            return Err(self.discovery_error(format!("tools/list failed: {e}")));
        }

        let catalogue = discovered
            .iter()
            .map(|tool| (tool.name.clone(), tool.clone()))
            .collect::<HashMap<_, _>>();
        let names: Vec<&str> = catalogue.keys().map(String::as_str).collect();
        tracing::info!(
            provider = %self.provider_id,
            count = catalogue.len(),
            tools = %names.join(", "),
            "discovered tools"
        );
        *self.tools_write() = catalogue;
        Ok(discovered)
    }

    /// Calls `tool_name` on the provider and maps its result to a JSON value.
    ///
    /// `timeout` covers waiting for the session as well as the call itself.
    /// When it expires a best-effort `notifications/cancelled` is sent; the
    /// provider may still finish the work.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::NotConnected`] if the connection is down.
    /// - [`GatewayError::ToolNotFound`] if the tool is not in the catalogue.
    /// - [`GatewayError::Timeout`] if the deadline passes.
    /// - [`GatewayError::Invocation`] for JSON-RPC errors, `isError` results
    ///   and transport failures.
    pub async fn invoke(
        &self,
        tool_name: &str,
        arguments: Arguments,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected(self.provider_id.clone()));
        }
        if !self.has_tool(tool_name) {
            return Err(GatewayError::ToolNotFound(tool_name.to_string()));
        }

        let timed_out = || GatewayError::Timeout {
            tool: tool_name.to_string(),
            timeout,
        };
        let deadline = deadline_after(timeout);
        let mut slot = tokio::time::timeout_at(deadline, self.session.lock())
            .await
            .map_err(|_| timed_out())?;
        let Some(session) = slot.as_mut() else {
            return Err(GatewayError::NotConnected(self.provider_id.clone()));
        };

        let params = json!({ "name": tool_name, "arguments": arguments });
        let error = match session.call("tools/call", params, deadline).await {
            Ok(result) => return map_tool_result(tool_name, result),
            Err(error) => error,
        };

        match error {
            CallError::Remote(remote) => Err(GatewayError::Invocation {
                tool: tool_name.to_string(),
                reason: remote.message,
            }),
            CallError::TimedOut { id, sent: true } => {
                tracing::warn!(provider = %self.provider_id, tool = tool_name, ?timeout, "tool call timed out, cancelling");
                let cancel = session.notify(
                    "notifications/cancelled",
                    Some(json!({ "requestId": id, "reason": "timeout" })),
                );
                match tokio::time::timeout(CANCEL_TIMEOUT, cancel).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => self.drop_session(&mut slot, &CallError::Io(e)),
                    Err(_) => self.drop_session(
                        &mut slot,
                        &CallError::Io(io::Error::new(io::ErrorKind::TimedOut, "cancellation write stalled")),
                    ),
                }
                Err(timed_out())
            }
            e @ CallError::TimedOut { sent: false, .. } => {
                self.drop_session(&mut slot, &e);
                Err(timed_out())
            }
            e @ CallError::Io(_) => {
                self.drop_session(&mut slot, &e);
                Err(GatewayError::Invocation {
                    tool: tool_name.to_string(),
                    reason: format!("provider connection lost: {e}"),
                })
            }
        }
    }

    /// Forgets a session whose stream can no longer be trusted.
    fn drop_session(&self, slot: &mut MutexGuard<'_, Option<Session>>, cause: &CallError) {
        if slot.take().is_some() {
            tracing::error!(provider = %self.provider_id, error = %cause, "provider connection lost");
        }
        self.connected.store(false, Ordering::Release);
        self.tools_write().clear();
    }

    /// Closes the transport, stops the provider process and clears the
    /// catalogue. Idempotent.
    pub async fn disconnect(&self) {
        let mut slot = self.session.lock().await;
        self.connected.store(false, Ordering::Release);
        self.tools_write().clear();
        if let Some(session) = slot.take() {
            session.close().await;
            tracing::info!(provider = %self.provider_id, "provider disconnected");
        }
    }
}

/// `timeout` from now, saturating at a far-future deadline.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

fn text_content(item: &Value) -> Option<&str> {
    if item.get("type").and_then(Value::as_str) == Some("text") {
        item.get("text").and_then(Value::as_str)
    } else {
        None
    }
}

/// Maps a `tools/call` result: `structuredContent` wins, then text content
/// (parsed as JSON when it is JSON), then the raw content array.
fn map_tool_result(tool_name: &str, result: Value) -> Result<Value, GatewayError> {
    let content = result
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let text = content
        .iter()
        .map(text_content)
        .collect::<Option<Vec<_>>>()
        .map(|parts| parts.join("\n"));

    if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        return Err(GatewayError::Invocation {
            tool: tool_name.to_string(),
            reason: text
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "tool reported an error".to_string()),
        });
    }

    if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
        return Ok(structured.clone());
    }
    if content.is_empty() {
        return Ok(Value::Null);
    }
    match text {
        Some(text) => Ok(serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))),
        None => Ok(Value::Array(content)),
    }
}
