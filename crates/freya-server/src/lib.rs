//! Freya runtime host: configuration, service wiring and the HTTP
//! introspection API.

pub mod api;
pub mod config;
pub mod runtime;

use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use freya_bus::MessageBus;
use freya_gateway::ToolGateway;
use freya_llm::ReasoningEngine;
use freya_resilience::BreakerRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use runtime::{Runtime, StartupError};

/// Maximum accepted request body size.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The message bus every service is attached to.
    pub bus: MessageBus,
    /// The tool gateway, unless disabled.
    pub gateway: Option<Arc<ToolGateway>>,
    /// The reasoning engine.
    pub engine: Option<Arc<ReasoningEngine>>,
    /// Circuit breakers by dependency name.
    pub breakers: Arc<BreakerRegistry>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("gateway", &self.gateway.is_some())
            .field("engine", &self.engine.is_some())
            .finish()
    }
}

impl AppState {
    /// State with no services attached.
    pub fn new(bus: MessageBus, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            bus,
            gateway: None,
            engine: None,
            breakers,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<ToolGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_engine(mut self, engine: Arc<ReasoningEngine>) -> Self {
        self.engine = Some(engine);
        self
    }
}

/// Health check handler.
///
/// Reports `ok` when every attached service is healthy and `degraded`
/// otherwise. Always answers `200 OK` so monitoring can tell a degraded
/// runtime from a dead one.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let gateway = state.gateway.as_ref().map(|g| {
        json!({
            "running": g.is_running(),
            "healthy": g.is_healthy(),
            "tool_calls": g.tool_call_count(),
            "errors": g.error_count(),
        })
    });
    let engine = state.engine.as_ref().map(|e| {
        json!({
            "running": e.is_running(),
            "healthy": e.is_healthy(),
            "generations": e.generation_count(),
            "errors": e.error_count(),
        })
    });
    let healthy = state.gateway.as_ref().map_or(true, |g| g.is_healthy())
        && state.engine.as_ref().map_or(true, |e| e.is_healthy());

    Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "tool_gateway": gateway,
            "llm_engine": engine,
        },
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tools", get(api::list_tools_handler))
        .route("/api/tools/{name}", get(api::get_tool_handler))
        .route("/api/providers", get(api::list_providers_handler))
        .route(
            "/api/providers/{provider_id}/reconnect",
            post(api::reconnect_provider_handler),
        )
        .route("/api/circuits", get(api::list_circuits_handler))
        .route("/api/circuits/reset", post(api::reset_circuits_handler))
        .route("/api/chat", post(api::chat_handler))
        .layer(axum::extract::DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
