use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use freya_gateway::{GatewayConfig, ProviderConfig};
use freya_llm::{ChatMessage, ChatReply, ModelClient, ModelError, ToolSpec};
use freya_server::{app, config::Config, Runtime};
use freya_types::{topics, RegistrySnapshot, ToolDescriptor};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

/// Answers every turn by echoing the last user message.
struct EchoModel;

impl ModelClient for EchoModel {
    fn chat<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        _tools: &'a [ToolSpec],
    ) -> BoxFuture<'a, Result<ChatReply, ModelError>> {
        let last = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Box::pin(async move { Ok(ChatReply::new(ChatMessage::assistant(format!("echo: {last}")))) })
    }

    fn model(&self) -> &str {
        "echo"
    }
}

/// Always fails with a client error.
struct BrokenModel;

impl ModelClient for BrokenModel {
    fn chat<'a>(
        &'a self,
        _messages: &'a [ChatMessage],
        _tools: &'a [ToolSpec],
    ) -> BoxFuture<'a, Result<ChatReply, ModelError>> {
        Box::pin(async {
            Err(ModelError::Status {
                status: 400,
                body: "bad request".to_string(),
            })
        })
    }

    fn model(&self) -> &str {
        "broken"
    }
}

fn offline_config() -> Config {
    let mut config = Config::default();
    config.gateway.enabled = false;
    config
}

async fn start(config: &Config, model: impl ModelClient + 'static) -> Runtime {
    Runtime::start_with_model(config, Arc::new(model))
        .await
        .expect("runtime should start")
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn weather_registry() -> RegistrySnapshot {
    RegistrySnapshot::new(
        vec![ToolDescriptor {
            name: "get_weather".to_string(),
            description: "Current weather for a location".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "location": { "type": "string" } },
            }),
            provider_id: "weather".to_string(),
        }],
        vec!["weather".to_string()],
    )
}

#[tokio::test]
async fn health_reports_running_services() {
    let runtime = start(&offline_config(), EchoModel).await;

    let (status, body) = send(app(runtime.state()), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["services"]["llm_engine"]["running"], true);
    assert!(body["services"]["tool_gateway"].is_null());

    runtime.shutdown().await;
}

#[tokio::test]
async fn tools_come_from_the_retained_registry() {
    let runtime = start(&offline_config(), EchoModel).await;
    let state = runtime.state();

    let (status, body) = send(app(state.clone()), get("/api/tools")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tool_count"], 0);

    state
        .bus
        .publish_json_retained(topics::TOOL_REGISTRY, &weather_registry())
        .unwrap();

    let (status, body) = send(app(state.clone()), get("/api/tools")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tool_count"], 1);
    assert_eq!(body["tools"][0]["name"], "get_weather");

    let (status, body) = send(app(state.clone()), get("/api/tools/get_weather")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider_id"], "weather");

    let (status, body) = send(app(state), get("/api/tools/launch_rocket")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("launch_rocket"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn providers_need_the_gateway() {
    let runtime = start(&offline_config(), EchoModel).await;

    let (status, body) = send(app(runtime.state()), get("/api/providers")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].is_string());

    runtime.shutdown().await;
}

#[tokio::test]
async fn unreachable_provider_is_reported_disconnected() {
    let mut config = Config::default();
    config.gateway = GatewayConfig {
        providers: vec![ProviderConfig {
            provider_id: "ghost".to_string(),
            command: "/nonexistent/freya-test-provider".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            enabled: true,
        }],
        ..GatewayConfig::default()
    };
    let runtime = start(&config, EchoModel).await;
    let state = runtime.state();

    let (status, body) = send(app(state.clone()), get("/api/providers")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["providers"][0]["provider_id"], "ghost");
    assert_eq!(body["providers"][0]["connected"], false);
    assert_eq!(body["providers"][0]["tool_count"], 0);

    let (status, _) = send(
        app(state.clone()),
        post_json("/api/providers/ghost/reconnect", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let (status, _) = send(
        app(state.clone()),
        post_json("/api/providers/nobody/reconnect", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(app(state), get("/health")).await;
    assert_eq!(body["services"]["tool_gateway"]["running"], true);

    runtime.shutdown().await;
}

#[tokio::test]
async fn circuits_can_be_listed_and_reset() {
    let mut config = offline_config();
    config.circuit.failure_threshold = 1;
    config.retry = freya_resilience::RetryPolicy::no_retry();
    let runtime = start(&config, BrokenModel).await;
    let state = runtime.state();

    let (status, body) = send(app(state.clone()), post_json("/api/chat", json!({"text": "hi"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fallback"], true);

    let (status, body) = send(app(state.clone()), get("/api/circuits")).await;
    assert_eq!(status, StatusCode::OK);
    let circuits = body["circuits"].as_array().unwrap();
    let ollama = circuits
        .iter()
        .find(|c| c["name"] == "ollama")
        .expect("model breaker should be registered");
    assert_eq!(ollama["state"], "open");

    let (_, body) = send(app(state.clone()), get("/health")).await;
    assert_eq!(body["status"], "degraded");

    let (status, body) = send(app(state.clone()), post_json("/api/circuits/reset", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["circuits"][0]["state"], "closed");

    let (_, body) = send(app(state), get("/health")).await;
    assert_eq!(body["status"], "ok");

    runtime.shutdown().await;
}

#[tokio::test]
async fn chat_runs_one_turn() {
    let runtime = start(&offline_config(), EchoModel).await;
    let state = runtime.state();

    let (status, body) = send(
        app(state.clone()),
        post_json("/api/chat", json!({"text": "  what time is it?  "})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["text"], "echo: what time is it?");
    assert_eq!(body["fallback"], false);

    let (status, body) = send(app(state.clone()), post_json("/api/chat", json!({"text": "   "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("empty"));

    let (status, body) = send(app(state.clone()), post_json("/api/chat", json!({"words": "hi"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("text"));

    let request = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(app(state), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    runtime.shutdown().await;
}
