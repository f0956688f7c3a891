//! Bus topic names.
//!
//! Every topic carries exactly one payload schema. The tool topics are the
//! wire contract between the reasoning engine and the tool gateway; the
//! `service.*` topics are free-form envelopes consumed by the dashboard.

/// Correlated tool-call requests ([`crate::ToolCallRequest`]).
pub const TOOL_CALL_REQUEST: &str = "tool.call.request";

/// Correlated tool-call results ([`crate::ToolCallResult`]).
pub const TOOL_CALL_RESULT: &str = "tool.call.result";

/// Merged tool registry ([`crate::RegistrySnapshot`]). Retained.
pub const TOOL_REGISTRY: &str = "tool.registry";

/// Provider status queries (empty object payload).
pub const PROVIDERS_QUERY: &str = "tool.providers.query";

/// Provider status reports ([`crate::ProvidersReport`]).
pub const PROVIDERS_STATUS: &str = "tool.providers.status";

/// User turns for the reasoning engine ([`crate::LlmRequest`]).
pub const LLM_REQUEST: &str = "llm.request";

/// Reasoning engine replies ([`crate::LlmResponse`]).
pub const LLM_RESPONSE: &str = "llm.response";

/// Turn-started notices for status displays ([`crate::LlmThinking`]).
pub const LLM_THINKING: &str = "llm.thinking";

/// Returns the status topic for a service, e.g. `service.tool_gateway.status`.
pub fn service_status(service: &str) -> String {
    format!("service.{service}.status")
}

/// Returns the metrics topic for a service, e.g. `service.tool_gateway.metrics`.
pub fn service_metrics(service: &str) -> String {
    format!("service.{service}.metrics")
}
