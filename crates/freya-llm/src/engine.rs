//! The reasoning engine service.
//!
//! A user turn runs a bounded loop: ask the model, run whatever tools it
//! asks for through the gateway, feed the results back, and repeat until the
//! model answers in plain text or the iteration limit is reached.

use crate::catalog::ToolCatalog;
use crate::chat::{ChatMessage, ChatReply, ToolSpec};
use crate::client::ModelClient;
use crate::config::LlmConfig;
use crate::error::{EngineError, ModelError};
use chrono::{DateTime, Utc};
use freya_bus::{BusError, CorrelationError, Correlator, Envelope, Listener, MessageBus};
use freya_resilience::{
    retry_through, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy,
};
use freya_types::topics;
use freya_types::{
    Arguments, LlmRequest, LlmResponse, LlmThinking, ServiceState, ServiceStatus,
    ToolCallRequest, ToolCallResult,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Service name used in status and metrics topics.
pub const SERVICE_NAME: &str = "llm_engine";

/// Circuit breaker name guarding the model backend.
pub const MODEL_BREAKER: &str = "ollama";

/// Tool deadline used unless [`ReasoningEngine::with_tool_timeout`] says
/// otherwise.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra wait past the tool deadline so the gateway's own timeout result
/// arrives before ours fires.
const TOOL_RESULT_GRACE: Duration = Duration::from_secs(1);

pub const ITERATION_FALLBACK: &str =
    "I apologize, but I'm having trouble completing that request. Could you try rephrasing it?";
pub const TIMEOUT_FALLBACK: &str =
    "Sorry, that took longer than it should have. Could you try again?";
pub const UNAVAILABLE_FALLBACK: &str =
    "I can't reach my language model right now. Please try again in a moment.";
pub const ERROR_FALLBACK: &str =
    "I'm sorry, I encountered an error processing that. Could you try again?";

/// User-facing text for a failed turn.
pub fn fallback_text(error: &EngineError) -> &'static str {
    if error.is_timeout() {
        return TIMEOUT_FALLBACK;
    }
    match error {
        EngineError::CircuitOpen { .. } | EngineError::RetryExhausted { .. } => {
            UNAVAILABLE_FALLBACK
        }
        _ => ERROR_FALLBACK,
    }
}

/// The outcome of one user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// True when the iteration limit was hit and `text` is canned.
    pub fallback: bool,
    /// Model calls made, retries not counted.
    pub model_calls: u32,
    pub tool_calls: u32,
}

/// Snapshot published on `service.llm_engine.metrics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineMetrics {
    pub service: String,
    pub model: String,
    pub generation_count: u64,
    pub tool_call_count: u64,
    pub error_count: u64,
    pub total_tokens: u64,
    pub history_length: usize,
    pub tools_available: usize,
    pub circuit_state: CircuitState,
    pub uptime_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

/// Turns user text into replies, calling tools through the bus.
///
/// Turns are serialized: the conversation is locked for the whole turn so
/// history stays in order.
pub struct ReasoningEngine {
    bus: MessageBus,
    model: Arc<dyn ModelClient>,
    config: LlmConfig,
    system_prompt: String,
    catalog: ToolCatalog,
    correlator: Correlator,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    model_timeout: Duration,
    tool_timeout: Duration,
    conversation: tokio::sync::Mutex<VecDeque<ChatMessage>>,
    history_len: AtomicUsize,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    generation_count: AtomicU64,
    tool_call_count: AtomicU64,
    error_count: AtomicU64,
    total_tokens: AtomicU64,
    listener: Mutex<Option<Listener>>,
}

impl std::fmt::Debug for ReasoningEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasoningEngine")
            .field("model", &self.model.model())
            .field("running", &self.is_running())
            .field("generation_count", &self.generation_count())
            .finish()
    }
}

fn recover<'a, T>(result: std::sync::LockResult<MutexGuard<'a, T>>, what: &str) -> MutexGuard<'a, T> {
    result.unwrap_or_else(|poisoned| {
        tracing::error!(lock = what, "engine lock poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Text handed back to the model for a tool's output.
fn render_tool_output(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

impl ReasoningEngine {
    /// Builds an engine with a private model breaker, the default retry
    /// policy and [`DEFAULT_TOOL_TIMEOUT`].
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus subscriptions fail.
    pub fn new(
        bus: MessageBus,
        model: Arc<dyn ModelClient>,
        config: LlmConfig,
    ) -> Result<Self, EngineError> {
        let catalog = ToolCatalog::new(bus.clone())?;
        let correlator = Correlator::new(bus.clone(), topics::TOOL_CALL_RESULT)?;
        Ok(Self {
            system_prompt: config.system_prompt(),
            model_timeout: config.model_timeout(),
            bus,
            model,
            config,
            catalog,
            correlator,
            breaker: Arc::new(CircuitBreaker::new(
                MODEL_BREAKER,
                CircuitBreakerConfig::default(),
            )),
            retry: RetryPolicy::default(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            conversation: tokio::sync::Mutex::new(VecDeque::new()),
            history_len: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            generation_count: AtomicU64::new(0),
            tool_call_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            listener: Mutex::new(None),
        })
    }

    /// Guards model calls with a shared breaker, typically from a
    /// `BreakerRegistry`.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Runs one user turn.
    ///
    /// Tool failures do not fail the turn; they are reported to the model as
    /// tool messages. Hitting the iteration limit yields a fallback reply.
    /// On error the user message is dropped from the history.
    ///
    /// # Errors
    ///
    /// - [`EngineError::CircuitOpen`] if the model breaker rejects the call.
    /// - [`EngineError::RetryExhausted`] if every attempt failed transiently.
    /// - [`EngineError::Model`] for a non-retryable model failure.
    pub async fn respond(&self, user_text: &str) -> Result<Reply, EngineError> {
        self.respond_at(user_text, None).await
    }

    /// Like [`ReasoningEngine::respond`], telling the model which room the
    /// user is in. The location note is not kept in the history.
    ///
    /// # Errors
    ///
    /// See [`ReasoningEngine::respond`].
    pub async fn respond_at(
        &self,
        user_text: &str,
        location: Option<&str>,
    ) -> Result<Reply, EngineError> {
        let started = Instant::now();
        let mut history = self.conversation.lock().await;
        history.push_back(ChatMessage::user(user_text));
        self.trim_history(&mut history);

        let outcome = self.run_turn(&history, location).await;
        match &outcome {
            Ok(reply) => {
                history.push_back(ChatMessage::assistant(reply.text.clone()));
                self.trim_history(&mut history);
                self.generation_count.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    model_calls = reply.model_calls,
                    tool_calls = reply.tool_calls,
                    fallback = reply.fallback,
                    chars = reply.text.len(),
                    elapsed = started.elapsed().as_secs_f64(),
                    "generated reply"
                );
            }
            Err(e) => {
                history.pop_back();
                self.error_count.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "reasoning turn failed");
            }
        }
        self.history_len.store(history.len(), Ordering::Relaxed);
        outcome
    }

    /// Runs one user turn, turning failures into fallback text.
    pub async fn respond_or_fallback(&self, user_text: &str) -> LlmResponse {
        self.answer(&LlmRequest::new(user_text)).await
    }

    /// Answers a request, echoing its location and turning failures into
    /// fallback text.
    pub async fn answer(&self, request: &LlmRequest) -> LlmResponse {
        let location = request.location.as_deref();
        let (text, fallback) = match self.respond_at(request.text.trim(), location).await {
            Ok(reply) => (reply.text, reply.fallback),
            Err(e) => (fallback_text(&e).to_string(), true),
        };
        LlmResponse {
            text,
            fallback,
            location: request.location.clone(),
        }
    }

    fn trim_history(&self, history: &mut VecDeque<ChatMessage>) {
        let max = self.config.max_history.max(1);
        if history.len() > max {
            let excess = history.len() - max;
            history.drain(..excess);
            tracing::debug!(kept = history.len(), "trimmed conversation history");
        }
    }

    async fn run_turn(
        &self,
        history: &VecDeque<ChatMessage>,
        location: Option<&str>,
    ) -> Result<Reply, EngineError> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        if let Some(location) = location.filter(|l| !l.is_empty() && *l != "unknown") {
            messages.push(ChatMessage::system(format!(
                "Note: The user is currently at the {location}."
            )));
        }
        messages.extend(history.iter().cloned());
        let tools = self.catalog.tool_specs();
        let max_iterations = self.config.max_tool_iterations.max(1);
        let mut tool_calls = 0;

        for iteration in 1..=max_iterations {
            let reply = self.call_model(&messages, &tools).await?;
            if let Some(tokens) = reply.eval_count {
                self.total_tokens.fetch_add(tokens, Ordering::Relaxed);
            }

            let message = reply.message;
            if message.tool_calls.is_empty() {
                return Ok(Reply {
                    text: message.content.trim().to_string(),
                    fallback: false,
                    model_calls: iteration,
                    tool_calls,
                });
            }

            tracing::info!(iteration, count = message.tool_calls.len(), "model requested tool calls");
            let calls = message.tool_calls.clone();
            messages.push(message);
            for call in calls {
                tool_calls += 1;
                let content = match self.call_tool(call.name(), call.arguments()).await {
                    Ok(output) => render_tool_output(output),
                    Err(e) => {
                        tracing::warn!(tool = call.name(), error = %e, "tool execution failed");
                        let reason = match e {
                            EngineError::Tool { reason, .. } => reason,
                            other => other.to_string(),
                        };
                        format!("Error executing {}: {reason}", call.name())
                    }
                };
                messages.push(ChatMessage::tool(call.name(), content));
            }
        }

        tracing::warn!(max_iterations, "reached tool iteration limit");
        Ok(Reply {
            text: ITERATION_FALLBACK.to_string(),
            fallback: true,
            model_calls: max_iterations,
            tool_calls,
        })
    }

    /// One model completion through the breaker, retry policy and model
    /// deadline. Every model error counts against the breaker; only
    /// transient ones are retried.
    async fn call_model(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ChatReply, EngineError> {
        let model = self.model.as_ref();
        let limit = self.model_timeout;
        let reply = retry_through(
            &self.retry,
            &self.breaker,
            move || async move {
                tokio::time::timeout(limit, model.chat(messages, tools))
                    .await
                    .unwrap_or_else(|_| Err(ModelError::Timeout(limit)))
            },
            ModelError::is_retryable,
            |_: &ModelError| true,
        )
        .await?;
        Ok(reply)
    }

    /// Runs a tool through the gateway and returns its output.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Tool`] if the gateway reports a failure.
    /// - [`EngineError::ToolTimeout`] if no result arrives in time.
    pub async fn call_tool(&self, tool_name: &str, arguments: Arguments) -> Result<Value, EngineError> {
        let request = ToolCallRequest {
            // Replaced by the correlator.
            request_id: String::new(),
            tool_name: tool_name.to_string(),
            arguments,
            timeout_seconds: self.tool_timeout.as_secs_f64(),
            issued_at: Utc::now(),
        };
        let Value::Object(payload) = serde_json::to_value(&request).map_err(BusError::from)? else {
            return Err(EngineError::Bus(BusError::InvalidPayload {
                topic: topics::TOOL_CALL_REQUEST.to_string(),
                reason: "tool call request is not an object".to_string(),
            }));
        };

        self.tool_call_count.fetch_add(1, Ordering::Relaxed);
        tracing::info!(tool = tool_name, "executing tool");
        if self.catalog.is_empty() {
            tracing::debug!(tool = tool_name, "tool catalogue is empty, calling anyway");
        }

        let value = match self
            .correlator
            .call(
                topics::TOOL_CALL_REQUEST,
                payload,
                self.tool_timeout + TOOL_RESULT_GRACE,
            )
            .await
        {
            Ok(value) => value,
            Err(e) if e.is_timeout() => {
                return Err(EngineError::ToolTimeout {
                    tool: tool_name.to_string(),
                    timeout: self.tool_timeout,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let result: ToolCallResult = serde_json::from_value(value)
            .map_err(|e| CorrelationError::InvalidPayload(e.to_string()))?;
        if result.success {
            tracing::info!(tool = tool_name, duration = result.duration_seconds, "tool completed");
            Ok(result.result.unwrap_or(Value::Null))
        } else {
            Err(EngineError::Tool {
                tool: tool_name.to_string(),
                reason: result.error.unwrap_or_else(|| "unknown error".to_string()),
            })
        }
    }

    /// Starts answering `llm.request` messages.
    ///
    /// An unreachable model backend is logged but does not prevent startup.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Bus`] if the subscription fails.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *recover(self.started_at.lock(), "started_at") = Some(Instant::now());
        tracing::info!(model = self.model.model(), "starting reasoning engine");

        match self.model.health().await {
            Ok(()) => tracing::info!(model = self.model.model(), "model backend reachable"),
            Err(e) => tracing::warn!(error = %e, "model backend not reachable, starting anyway"),
        }

        let weak = Arc::downgrade(self);
        let listener = self.bus.listen(topics::LLM_REQUEST, move |envelope| {
            let weak = weak.clone();
            async move {
                if let Some(engine) = weak.upgrade() {
                    engine.on_request(envelope).await;
                }
            }
        });
        match listener {
            Ok(listener) => *recover(self.listener.lock(), "listener") = Some(listener),
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        }

        self.publish_status(ServiceState::Started);
        tracing::info!(tools = self.catalog.len(), "reasoning engine started");
        Ok(())
    }

    async fn on_request(&self, envelope: Envelope) {
        let request = match serde_json::from_value::<LlmRequest>(envelope.payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed llm request");
                return;
            }
        };
        if request.text.trim().is_empty() {
            tracing::warn!(location = ?request.location, "ignoring empty llm request");
            return;
        }

        let thinking = LlmThinking {
            status: "processing".to_string(),
            input: request.text.trim().to_string(),
            location: request.location.clone(),
        };
        if let Err(e) = self.bus.publish_json(topics::LLM_THINKING, &thinking) {
            tracing::warn!(error = %e, "failed to publish thinking notice");
        }

        let response = self.answer(&request).await;
        if let Err(e) = self.bus.publish_json(topics::LLM_RESPONSE, &response) {
            tracing::error!(error = %e, "failed to publish llm response");
        }
        self.publish_metrics();
    }

    /// Stops answering requests and publishes the final status and metrics.
    /// Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        recover(self.listener.lock(), "listener").take();
        self.publish_status(ServiceState::Stopped);
        self.publish_metrics();
        tracing::info!(generations = self.generation_count(), "reasoning engine stopped");
    }

    pub async fn clear_history(&self) {
        let mut history = self.conversation.lock().await;
        let cleared = history.len();
        history.clear();
        self.history_len.store(0, Ordering::Relaxed);
        tracing::info!(cleared, "cleared conversation history");
    }

    /// Messages kept from previous turns.
    pub fn history_len(&self) -> usize {
        self.history_len.load(Ordering::Relaxed)
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Healthy unless the model circuit is open.
    pub fn is_healthy(&self) -> bool {
        self.breaker.state() != CircuitState::Open
    }

    pub fn generation_count(&self) -> u64 {
        self.generation_count.load(Ordering::Relaxed)
    }

    pub fn tool_call_count(&self) -> u64 {
        self.tool_call_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    fn uptime_seconds(&self) -> Option<f64> {
        recover(self.started_at.lock(), "started_at").map(|at| at.elapsed().as_secs_f64())
    }

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            service: SERVICE_NAME.to_string(),
            model: self.model.model().to_string(),
            generation_count: self.generation_count(),
            tool_call_count: self.tool_call_count(),
            error_count: self.error_count(),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            history_length: self.history_len(),
            tools_available: self.catalog.len(),
            circuit_state: self.breaker.state(),
            uptime_seconds: self.uptime_seconds().unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }

    fn publish_metrics(&self) {
        let metrics = self.metrics();
        if let Err(e) = self
            .bus
            .publish_json(&topics::service_metrics(SERVICE_NAME), &metrics)
        {
            tracing::warn!(error = %e, "failed to publish engine metrics");
        }
    }

    fn publish_status(&self, state: ServiceState) {
        let status = ServiceStatus::new(SERVICE_NAME, state, self.is_healthy(), self.is_running())
            .with_uptime(self.uptime_seconds())
            .with_error_count(self.error_count())
            .with_details(json!({
                "model": self.model.model(),
                "tools_available": self.catalog.len(),
                "max_tool_iterations": self.config.max_tool_iterations,
                "generations": self.generation_count(),
            }));
        if let Err(e) = self
            .bus
            .publish_json(&topics::service_status(SERVICE_NAME), &status)
        {
            tracing::warn!(error = %e, "failed to publish engine status");
        }
    }
}
