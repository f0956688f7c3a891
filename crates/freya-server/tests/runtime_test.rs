use freya_llm::{ChatMessage, ChatReply, ModelClient, ModelError, ToolSpec};
use freya_bus::MessageBus;
use freya_server::{config::Config, Runtime, StartupError};
use freya_types::{topics, LlmRequest, LlmResponse};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

struct FixedModel(&'static str);

impl ModelClient for FixedModel {
    fn chat<'a>(
        &'a self,
        _messages: &'a [ChatMessage],
        _tools: &'a [ToolSpec],
    ) -> BoxFuture<'a, Result<ChatReply, ModelError>> {
        Box::pin(async move { Ok(ChatReply::new(ChatMessage::assistant(self.0))) })
    }

    fn model(&self) -> &str {
        "fixed"
    }
}

fn offline_config() -> Config {
    let mut config = Config::default();
    config.gateway.enabled = false;
    config
}

#[tokio::test]
async fn bus_requests_are_answered_until_shutdown() {
    let runtime = Runtime::start_with_model(&offline_config(), Arc::new(FixedModel("It is sunny.")))
        .await
        .unwrap();
    let state = runtime.state();
    assert!(state.gateway.is_none());

    let mut responses = state.bus.subscribe(topics::LLM_RESPONSE).unwrap();
    state
        .bus
        .publish_json(
            topics::LLM_REQUEST,
            &LlmRequest::new("How is the weather?").with_location("kitchen"),
        )
        .unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(5), responses.recv())
        .await
        .expect("engine should answer")
        .expect("subscription should be open");
    let response: LlmResponse = serde_json::from_value(envelope.payload).unwrap();
    assert_eq!(response.text, "It is sunny.");
    assert!(!response.fallback);
    assert_eq!(response.location.as_deref(), Some("kitchen"));

    let engine = state.engine.clone().unwrap();
    assert!(engine.is_running());

    runtime.shutdown().await;

    assert!(!engine.is_running());
    assert!(state.bus.is_closed());
    assert!(state
        .bus
        .publish_json(topics::LLM_REQUEST, &LlmRequest::new("hi"))
        .is_err());
}

#[tokio::test]
async fn gateway_starts_with_no_providers() {
    let runtime = Runtime::start_with_model(&Config::default(), Arc::new(FixedModel("ok")))
        .await
        .unwrap();
    let state = runtime.state();

    let gateway = state.gateway.clone().expect("gateway enabled by default");
    assert!(gateway.is_running());
    assert!(gateway.is_healthy());
    assert_eq!(gateway.registry_snapshot().tool_count, 0);

    runtime.shutdown().await;
    assert!(!gateway.is_running());
}

/// Closes the bus from its health check, so the engine cannot subscribe.
struct BusClosingModel(MessageBus);

impl ModelClient for BusClosingModel {
    fn chat<'a>(
        &'a self,
        _messages: &'a [ChatMessage],
        _tools: &'a [ToolSpec],
    ) -> BoxFuture<'a, Result<ChatReply, ModelError>> {
        Box::pin(async { Ok(ChatReply::new(ChatMessage::assistant("unused"))) })
    }

    fn health(&self) -> BoxFuture<'_, Result<(), ModelError>> {
        self.0.shutdown();
        Box::pin(async { Ok(()) })
    }

    fn model(&self) -> &str {
        "closing"
    }
}

#[tokio::test]
async fn engine_start_failure_unwinds_the_gateway() {
    let bus = MessageBus::new();
    let model = Arc::new(BusClosingModel(bus.clone()));

    let err = Runtime::start_on(&Config::default(), bus.clone(), model)
        .await
        .unwrap_err();

    assert!(matches!(err, StartupError::Engine(_)), "{err}");
    assert!(bus.is_closed());
}
