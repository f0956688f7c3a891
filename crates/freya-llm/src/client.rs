//! Language-model backends.

use crate::chat::{ChatMessage, ChatReply, ToolSpec};
use crate::config::LlmConfig;
use crate::error::ModelError;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// A chat-completion backend.
///
/// The engine enforces its own deadline around [`ModelClient::chat`], so
/// implementations need not time out on their own.
pub trait ModelClient: Send + Sync {
    /// Runs one completion over `messages`, offering `tools`.
    fn chat<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        tools: &'a [ToolSpec],
    ) -> BoxFuture<'a, Result<ChatReply, ModelError>>;

    /// Checks that the backend is reachable.
    fn health(&self) -> BoxFuture<'_, Result<(), ModelError>> {
        Box::pin(async { Ok(()) })
    }

    /// Model identifier for logs and status reports.
    fn model(&self) -> &str;
}

/// Client for a local Ollama server's `/api/chat` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f64,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolSpec],
    stream: bool,
    options: ChatOptions,
}

fn no_tools(tools: &&[ToolSpec]) -> bool {
    tools.is_empty()
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f64,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
    #[serde(default)]
    eval_count: Option<u64>,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("freya/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to build configured HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self {
            http,
            base_url: config.base_url(),
            model: config.model.clone(),
            temperature: config.temperature,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ChatReply, ModelError> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            tools,
            stream: false,
            options: ChatOptions {
                temperature: self.temperature,
            },
        };
        tracing::debug!(
            model = %self.model,
            messages = messages.len(),
            tools = tools.len(),
            "sending chat request"
        );

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let parsed: ChatResponse =
            serde_json::from_slice(&body).map_err(|e| ModelError::Decode(e.to_string()))?;
        Ok(ChatReply {
            message: parsed.message,
            eval_count: parsed.eval_count,
        })
    }

    async fn list_models(&self) -> Result<(), ModelError> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ModelError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

impl ModelClient for OllamaClient {
    fn chat<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        tools: &'a [ToolSpec],
    ) -> BoxFuture<'a, Result<ChatReply, ModelError>> {
        Box::pin(self.send_chat(messages, tools))
    }

    fn health(&self) -> BoxFuture<'_, Result<(), ModelError>> {
        Box::pin(self.list_models())
    }

    fn model(&self) -> &str {
        &self.model
    }
}
