//! Shared wire types and topic names for the Freya runtime.
//!
//! This crate defines the JSON payloads exchanged over the message bus between
//! the reasoning engine, the tool gateway and every other service. It has no
//! runtime behaviour of its own, so every crate in the workspace can depend on
//! it without pulling in tokio or the bus implementation.
//!
//! # Tool calls
//!
//! | Topic | Payload |
//! |-------|---------|
//! | `tool.call.request` | [`ToolCallRequest`] |
//! | `tool.call.result` | [`ToolCallResult`] |
//! | `tool.registry` | [`RegistrySnapshot`] (retained) |
//! | `tool.providers.status` | [`ProvidersReport`] |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod service;
pub mod topics;

pub use service::{ServiceState, ServiceStatus};

/// Tool arguments as a JSON object.
pub type Arguments = Map<String, Value>;

/// A correlated request to run one tool.
///
/// `request_id` is generated by the caller and echoed back unchanged in the
/// matching [`ToolCallResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Correlation token (UUID v4).
    pub request_id: String,
    /// Registry name of the tool to run.
    pub tool_name: String,
    /// Structured tool arguments.
    #[serde(default)]
    pub arguments: Arguments,
    /// Deadline the caller is willing to wait, in seconds. Zero or negative
    /// means the gateway's default deadline applies.
    #[serde(default)]
    pub timeout_seconds: f64,
    /// When the caller issued the request.
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
}

/// The outcome of a [`ToolCallRequest`].
///
/// Exactly one result is published per request. `result` is `null` on
/// failure and `error` is `null` on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Correlation token copied from the request.
    pub request_id: String,
    /// Tool name copied from the request.
    pub tool_name: String,
    /// Whether the tool ran successfully.
    pub success: bool,
    /// Tool output.
    #[serde(default)]
    pub result: Option<Value>,
    /// Failure description.
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock time spent handling the request.
    #[serde(default)]
    pub duration_seconds: f64,
}

impl ToolCallResult {
    /// Builds a successful result.
    pub fn success(
        request_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: Value,
        duration_seconds: f64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            tool_name: tool_name.into(),
            success: true,
            result: Some(result),
            error: None,
            duration_seconds,
        }
    }

    /// Builds a failed result.
    pub fn failure(
        request_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: impl Into<String>,
        duration_seconds: f64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            tool_name: tool_name.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            duration_seconds,
        }
    }
}

/// A tool advertised by a capability provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Name, unique within the merged registry.
    pub name: String,
    /// Human-readable description passed to the language model.
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool arguments.
    #[serde(default)]
    pub input_schema: Value,
    /// Identifier of the provider that owns the tool.
    pub provider_id: String,
}

/// The merged tool registry published on `tool.registry`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Every routable tool, sorted by name.
    pub tools: Vec<ToolDescriptor>,
    /// Number of entries in `tools`.
    pub tool_count: usize,
    /// Identifiers of every configured provider, connected or not.
    pub providers: Vec<String>,
}

impl RegistrySnapshot {
    /// Builds a snapshot, sorting tools by name.
    pub fn new(mut tools: Vec<ToolDescriptor>, providers: Vec<String>) -> Self {
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            tool_count: tools.len(),
            tools,
            providers,
        }
    }

    /// Looks up a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|tool| tool.name == name)
    }
}

/// Connection state of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    /// Provider identifier.
    pub provider_id: String,
    /// Whether the provider is currently connected.
    pub connected: bool,
    /// Number of tools in the provider's last-discovered catalogue.
    pub tool_count: usize,
}

/// Reply to a `tool.providers.query`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidersReport {
    /// One entry per configured provider.
    pub providers: Vec<ProviderStatus>,
}

/// A user turn handed to the reasoning engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Transcribed or typed user text.
    pub text: String,
    /// Where the user is speaking from, e.g. "kitchen".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl LlmRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Published on `llm.thinking` when a turn starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmThinking {
    /// Always "processing".
    pub status: String,
    /// The user text being answered.
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// The reasoning engine's reply to an [`LlmRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Text to speak or display.
    pub text: String,
    /// True when `text` is a canned fallback rather than a model answer.
    #[serde(default)]
    pub fallback: bool,
    /// Echo of the request's location, so the reply is spoken in the
    /// right room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}
