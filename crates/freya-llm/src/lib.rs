//! Reasoning engine for the Freya runtime.
//!
//! The engine answers `llm.request` messages with `llm.response` messages.
//! In between it talks to a language model through a [`ModelClient`]
//! (Ollama in production) and runs the tools the model asks for by sending
//! correlated `tool.call.request` messages to the tool gateway.
//!
//! Model calls go through a circuit breaker, a retry policy and a per-call
//! deadline. Tool calls are never retried; their failures are shown to the
//! model, which decides what to tell the user.

pub mod catalog;
pub mod chat;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;

pub use catalog::ToolCatalog;
pub use chat::{ChatMessage, ChatReply, FunctionCall, FunctionSpec, Role, ToolCall, ToolSpec};
pub use client::{ModelClient, OllamaClient};
pub use config::LlmConfig;
pub use engine::{
    fallback_text, EngineMetrics, ReasoningEngine, Reply, DEFAULT_TOOL_TIMEOUT, ERROR_FALLBACK,
    ITERATION_FALLBACK, MODEL_BREAKER, SERVICE_NAME, TIMEOUT_FALLBACK, UNAVAILABLE_FALLBACK,
};
pub use error::{EngineError, ModelError};
