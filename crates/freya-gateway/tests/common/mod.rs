//! In-memory MCP server for gateway tests.

#![allow(dead_code)]

use freya_gateway::{ProviderConnection, ProviderTransport, TransportChannel};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};

/// What the fake server does with a `tools/call`.
#[derive(Debug, Clone)]
pub enum ToolReply {
    /// Single text content item.
    Text(String),
    /// `structuredContent` plus its text rendering.
    Structured(Value),
    /// `isError: true` with a text message.
    ToolError(String),
    /// JSON-RPC error response.
    RpcError(String),
    /// Never answer.
    Hang,
    /// Answer after a delay.
    Delayed(Duration, Box<ToolReply>),
    /// Close the connection without answering.
    Crash,
}

type Handler = Arc<dyn Fn(&str, &Value) -> ToolReply + Send + Sync>;

#[derive(Clone)]
pub struct FakeProvider {
    tools: Arc<Mutex<Vec<String>>>,
    page_size: usize,
    refuse: bool,
    handler: Handler,
    received: Arc<Mutex<Vec<Value>>>,
}

impl FakeProvider {
    /// A provider advertising `tools`. Every call echoes the tool name and
    /// arguments back as structured content.
    pub fn new(tools: &[&str]) -> Self {
        Self {
            tools: Arc::new(Mutex::new(tools.iter().map(|t| t.to_string()).collect())),
            page_size: usize::MAX,
            refuse: false,
            handler: Arc::new(|tool, args| {
                ToolReply::Structured(json!({ "tool": tool, "arguments": args }))
            }),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A provider whose transport cannot be opened.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new(&[])
        }
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &Value) -> ToolReply + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn set_tools(&self, tools: &[&str]) {
        *self.tools.lock().unwrap() = tools.iter().map(|t| t.to_string()).collect();
    }

    pub fn connection(&self, provider_id: &str) -> ProviderConnection {
        ProviderConnection::new(provider_id, self.clone())
    }

    /// Every message the server has received, in order.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|m| m["method"].as_str().map(str::to_owned))
            .collect()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.received_methods().iter().filter(|m| *m == method).count()
    }

    /// Waits until the server has seen `count` messages for `method`.
    /// Notifications are fire-and-forget, so the client can finish before
    /// the server has read them.
    pub async fn wait_for_calls(&self, method: &str, count: usize) {
        for _ in 0..200 {
            if self.calls_to(method) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {count} {method} message(s), saw {}",
            self.calls_to(method)
        );
    }

    async fn serve(self, stream: DuplexStream) {
        let (reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        let mut lines = BufReader::new(reader).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(message) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            self.received.lock().unwrap().push(message.clone());

            let Some(id) = message.get("id").cloned() else {
                continue;
            };
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            match message["method"].as_str().unwrap_or_default() {
                "initialize" => {
                    let result = json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": { "tools": {} },
                        "serverInfo": { "name": "fake-mcp", "version": "0.0.1" },
                    });
                    send(&writer, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
                }
                "tools/list" => {
                    let result = self.list_page(&params);
                    send(&writer, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
                }
                "tools/call" => {
                    let name = params["name"].as_str().unwrap_or_default().to_string();
                    let reply = (self.handler)(&name, &params["arguments"]);
                    if matches!(reply, ToolReply::Crash) {
                        return;
                    }
                    let writer = writer.clone();
                    tokio::spawn(async move { answer_call(&writer, id, reply).await });
                }
                other => {
                    let error = json!({"code": -32601, "message": format!("method not found: {other}")});
                    send(&writer, json!({"jsonrpc": "2.0", "id": id, "error": error})).await;
                }
            }
        }
    }

    fn list_page(&self, params: &Value) -> Value {
        let tools = self.tools.lock().unwrap().clone();
        let start: usize = params["cursor"]
            .as_str()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let end = start.saturating_add(self.page_size).min(tools.len());
        let page: Vec<Value> = tools[start..end]
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "description": format!("{name} tool"),
                    "inputSchema": {
                        "type": "object",
                        "properties": { "city": { "type": "string" } },
                    },
                })
            })
            .collect();

        let mut result = json!({ "tools": page });
        if end < tools.len() {
            result["nextCursor"] = json!(end.to_string());
        }
        result
    }
}

impl ProviderTransport for FakeProvider {
    fn open(&self) -> BoxFuture<'_, io::Result<TransportChannel>> {
        let server = self.clone();
        Box::pin(async move {
            if server.refuse {
                return Err(io::Error::new(io::ErrorKind::NotFound, "provider binary not found"));
            }
            let (client, remote) = tokio::io::duplex(64 * 1024);
            tokio::spawn(server.serve(remote));
            let (reader, writer) = tokio::io::split(client);
            Ok(TransportChannel::new(reader, writer))
        })
    }
}

async fn send(writer: &tokio::sync::Mutex<WriteHalf<DuplexStream>>, message: Value) {
    let mut line = serde_json::to_vec(&message).unwrap();
    line.push(b'\n');
    let _ = writer.lock().await.write_all(&line).await;
}

fn answer_call(
    writer: &tokio::sync::Mutex<WriteHalf<DuplexStream>>,
    id: Value,
    reply: ToolReply,
) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        // Progress chatter before every answer, which clients must skip.
        send(
            writer,
            json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {"progress": 0}}),
        )
        .await;

        let text = |t: &str| json!([{ "type": "text", "text": t }]);
        let response = match reply {
            ToolReply::Text(t) => json!({"jsonrpc": "2.0", "id": id, "result": {"content": text(&t)}}),
            ToolReply::Structured(v) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"content": text(&v.to_string()), "structuredContent": v},
            }),
            ToolReply::ToolError(t) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"content": text(&t), "isError": true},
            }),
            ToolReply::RpcError(message) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32000, "message": message},
            }),
            ToolReply::Hang | ToolReply::Crash => return,
            ToolReply::Delayed(delay, inner) => {
                tokio::time::sleep(delay).await;
                return answer_call(writer, id, *inner).await;
            }
        };
        send(writer, response).await;
    })
}
