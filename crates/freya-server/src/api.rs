//! HTTP handlers for tools, providers, circuits and chat.

use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use freya_gateway::{GatewayError, ToolGateway};
use freya_llm::ReasoningEngine;
use freya_types::{topics, LlmRequest, LlmResponse, ProvidersReport, RegistrySnapshot, ToolDescriptor};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("upstream failure: {0}")]
    BadGateway(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

fn gateway(state: &AppState) -> Result<&Arc<ToolGateway>, ApiError> {
    state
        .gateway
        .as_ref()
        .ok_or_else(|| ApiError::ServiceUnavailable("tool gateway is disabled".to_string()))
}

fn engine(state: &AppState) -> Result<&Arc<ReasoningEngine>, ApiError> {
    state
        .engine
        .as_ref()
        .ok_or_else(|| ApiError::ServiceUnavailable("reasoning engine is not running".to_string()))
}

/// The registry as last published on the bus, or an empty one.
fn current_registry(state: &AppState) -> RegistrySnapshot {
    state
        .bus
        .retained(topics::TOOL_REGISTRY)
        .and_then(|payload| match serde_json::from_value(payload) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(error = %e, "retained tool registry is malformed");
                None
            }
        })
        .unwrap_or_default()
}

/// Handler for `GET /api/tools`.
pub async fn list_tools_handler(Extension(state): Extension<Arc<AppState>>) -> Json<RegistrySnapshot> {
    Json(current_registry(&state))
}

/// Handler for `GET /api/tools/{name}`.
pub async fn get_tool_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ToolDescriptor>, ApiError> {
    current_registry(&state)
        .get(&name)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("tool '{name}'")))
}

/// Handler for `GET /api/providers`.
pub async fn list_providers_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<ProvidersReport>, ApiError> {
    Ok(Json(gateway(&state)?.providers_status()))
}

/// Handler for `POST /api/providers/{provider_id}/reconnect`.
pub async fn reconnect_provider_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(provider_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let gateway = gateway(&state)?;
    match gateway.reconnect_provider(&provider_id).await {
        Ok(tool_count) => Ok(Json(json!({
            "provider_id": provider_id,
            "connected": true,
            "tool_count": tool_count,
        }))),
        Err(GatewayError::UnknownProvider(id)) => Err(ApiError::NotFound(format!("provider '{id}'"))),
        Err(e) => Err(ApiError::BadGateway(e.to_string())),
    }
}

/// Handler for `GET /api/circuits`.
pub async fn list_circuits_handler(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "circuits": state.breakers.stats() }))
}

/// Handler for `POST /api/circuits/reset`. Closes every breaker.
pub async fn reset_circuits_handler(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    state.breakers.reset_all();
    tracing::info!("all circuit breakers reset");
    Json(json!({ "circuits": state.breakers.stats() }))
}

/// Handler for `POST /api/chat`. Runs one turn, answering with fallback
/// text if the turn fails.
pub async fn chat_handler(
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<LlmRequest>, JsonRejection>,
) -> Result<Json<LlmResponse>, ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let engine = engine(&state)?;
    if request.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".to_string()));
    }
    Ok(Json(engine.answer(&request).await))
}
