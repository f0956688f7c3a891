//! The tool-invocation gateway service.
//!
//! Owns one [`ProviderConnection`] per enabled provider, merges their
//! catalogues into a single registry and answers `tool.call.request`
//! messages with exactly one `tool.call.result` each.

use crate::config::{secs_to_duration, CollisionPolicy, GatewayConfig};
use crate::error::GatewayError;
use crate::provider::ProviderConnection;
use chrono::{DateTime, Utc};
use freya_bus::{Envelope, Listener, MessageBus, REQUEST_ID_FIELD};
use freya_types::topics;
use freya_types::{
    Arguments, ProviderStatus, ProvidersReport, RegistrySnapshot, ServiceState, ServiceStatus,
    ToolCallRequest, ToolCallResult, ToolDescriptor,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Service name used in status and metrics topics.
pub const SERVICE_NAME: &str = "tool_gateway";

/// Metrics are published after every this many tool calls.
const METRICS_INTERVAL: u64 = 10;

/// Separator between provider id and tool name under
/// [`CollisionPolicy::Namespace`].
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Snapshot published on `service.tool_gateway.metrics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayMetrics {
    pub service: String,
    pub tool_call_count: u64,
    pub total_tools: usize,
    pub providers_configured: usize,
    pub providers_connected: usize,
    pub connected_providers: Vec<String>,
    pub error_count: u64,
    pub uptime_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Route {
    provider_id: String,
    /// Name the provider knows the tool by.
    tool_name: String,
}

#[derive(Debug, Default)]
struct Registry {
    descriptors: HashMap<String, ToolDescriptor>,
    routes: HashMap<String, Route>,
}

/// Routes correlated tool calls to capability providers.
///
/// Shared as `Arc<ToolGateway>`; [`ToolGateway::start`] subscribes it to the
/// bus and [`ToolGateway::stop`] tears everything down.
pub struct ToolGateway {
    bus: MessageBus,
    config: GatewayConfig,
    providers: Vec<Arc<ProviderConnection>>,
    registry: RwLock<Registry>,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    tool_call_count: AtomicU64,
    error_count: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
    in_flight: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for ToolGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolGateway")
            .field("providers", &self.providers)
            .field("running", &self.is_running())
            .field("tool_call_count", &self.tool_call_count())
            .finish()
    }
}

fn recover<'a, T>(result: std::sync::LockResult<MutexGuard<'a, T>>, what: &str) -> MutexGuard<'a, T> {
    result.unwrap_or_else(|poisoned| {
        tracing::error!(lock = what, "gateway lock poisoned, recovering");
        poisoned.into_inner()
    })
}

impl ToolGateway {
    /// Builds a gateway with a stdio connection per enabled provider in
    /// `config`. Nothing is connected until [`ToolGateway::start`].
    pub fn new(bus: MessageBus, config: GatewayConfig) -> Self {
        let providers = config
            .enabled_providers()
            .map(ProviderConnection::from_config)
            .collect();
        Self::with_providers(bus, config, providers)
    }

    /// Builds a gateway over pre-built connections. `config.providers` is
    /// ignored.
    pub fn with_providers(
        bus: MessageBus,
        config: GatewayConfig,
        providers: Vec<ProviderConnection>,
    ) -> Self {
        Self {
            bus,
            config,
            providers: providers.into_iter().map(Arc::new).collect(),
            registry: RwLock::new(Registry::default()),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            tool_call_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    /// Connects every provider, builds and publishes the registry, and
    /// starts answering requests. Provider failures are logged and counted;
    /// the gateway starts regardless.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Bus`] if the bus subscriptions fail.
    pub async fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *recover(self.started_at.lock(), "started_at") = Some(Instant::now());
        tracing::info!(providers = self.providers.len(), "starting tool gateway");

        let outcomes = futures_util::future::join_all(
            self.providers.iter().map(|provider| connect_and_discover(provider)),
        )
        .await;
        let failed = outcomes.iter().filter(|outcome| outcome.is_err()).count();
        self.error_count.fetch_add(failed as u64, Ordering::Relaxed);

        let snapshot = self.rebuild_registry();
        self.publish_registry(&snapshot);

        let listeners = match self.subscribe() {
            Ok(listeners) => listeners,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e);
            }
        };
        recover(self.listeners.lock(), "listeners").extend(listeners);

        self.publish_status(ServiceState::Started);
        tracing::info!(
            connected = self.connected_count(),
            configured = self.providers.len(),
            failed,
            tools = snapshot.tool_count,
            "tool gateway started"
        );
        Ok(())
    }

    fn subscribe(self: &Arc<Self>) -> Result<Vec<Listener>, GatewayError> {
        let weak = Arc::downgrade(self);
        let requests = self.bus.listen(topics::TOOL_CALL_REQUEST, move |envelope| {
            if let Some(gateway) = weak.upgrade() {
                gateway.spawn_request(envelope);
            }
            std::future::ready(())
        })?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let queries = self.bus.listen(topics::PROVIDERS_QUERY, move |_| {
            if let Some(gateway) = weak.upgrade() {
                let report = gateway.providers_status();
                if let Err(e) = gateway.bus.publish_json(topics::PROVIDERS_STATUS, &report) {
                    tracing::warn!(error = %e, "failed to publish provider status");
                }
            }
            std::future::ready(())
        })?;

        Ok(vec![requests, queries])
    }

    /// Handles each request on its own task so a slow tool does not hold up
    /// the others.
    fn spawn_request(self: &Arc<Self>, envelope: Envelope) {
        let gateway = self.clone();
        let mut in_flight = recover(self.in_flight.lock(), "in_flight");
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move { gateway.on_request(envelope).await });
    }

    async fn on_request(&self, envelope: Envelope) {
        let request = match serde_json::from_value::<ToolCallRequest>(envelope.payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                self.reject_malformed(&envelope.payload, &e);
                return;
            }
        };

        let result = self.handle_request(request).await;
        if let Err(e) = self.bus.publish_json(topics::TOOL_CALL_RESULT, &result) {
            tracing::error!(request_id = %result.request_id, error = %e, "failed to publish tool result");
        }

        if self.tool_call_count() % METRICS_INTERVAL == 0 {
            self.publish_metrics();
        }
    }

    fn reject_malformed(&self, payload: &Value, error: &serde_json::Error) {
        let Some(request_id) = payload.get(REQUEST_ID_FIELD).and_then(Value::as_str) else {
            tracing::warn!(%error, "dropping malformed tool call request without request_id");
            return;
        };
        let tool_name = payload
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        tracing::warn!(request_id, %error, "rejecting malformed tool call request");
        self.error_count.fetch_add(1, Ordering::Relaxed);

        let result = ToolCallResult::failure(
            request_id,
            tool_name,
            format!("malformed tool call request: {error}"),
            0.0,
        );
        if let Err(e) = self.bus.publish_json(topics::TOOL_CALL_RESULT, &result) {
            tracing::error!(request_id, error = %e, "failed to publish tool result");
        }
    }

    /// Runs one request and builds its result. Never fails: every error
    /// becomes a `success: false` result. No retry.
    pub async fn handle_request(&self, request: ToolCallRequest) -> ToolCallResult {
        let started = Instant::now();
        let timeout =
            secs_to_duration(request.timeout_seconds).unwrap_or_else(|| self.config.default_timeout());
        if self.config.log_tool_calls {
            tracing::info!(request_id = %request.request_id, tool = %request.tool_name, ?timeout, "tool call");
        } else {
            tracing::debug!(request_id = %request.request_id, tool = %request.tool_name, ?timeout, "tool call");
        }

        let outcome = self
            .invoke(&request.tool_name, request.arguments, timeout)
            .await;
        let duration = started.elapsed().as_secs_f64();
        self.tool_call_count.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(value) => {
                tracing::debug!(request_id = %request.request_id, tool = %request.tool_name, duration, "tool call succeeded");
                ToolCallResult::success(request.request_id, request.tool_name, value, duration)
            }
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(request_id = %request.request_id, tool = %request.tool_name, error = %e, "tool call failed");
                ToolCallResult::failure(request.request_id, request.tool_name, e.to_string(), duration)
            }
        }
    }

    /// Invokes a registry tool on its owning provider.
    ///
    /// # Errors
    ///
    /// [`GatewayError::ToolNotFound`] if no provider owns `tool_name`,
    /// otherwise whatever [`ProviderConnection::invoke`] returns.
    pub async fn invoke(
        &self,
        tool_name: &str,
        arguments: Arguments,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let route = self
            .read_registry()
            .routes
            .get(tool_name)
            .cloned()
            .ok_or_else(|| GatewayError::ToolNotFound(tool_name.to_string()))?;
        let provider = self
            .provider(&route.provider_id)
            .ok_or_else(|| GatewayError::UnknownProvider(route.provider_id.clone()))?;
        let outcome = provider.invoke(&route.tool_name, arguments, timeout).await;
        if outcome.is_err() && !provider.is_connected() {
            tracing::warn!(provider = %route.provider_id, "provider connection lost, dropping its tools");
            let snapshot = self.rebuild_registry();
            self.publish_registry(&snapshot);
        }
        outcome
    }

    fn provider(&self, provider_id: &str) -> Option<&Arc<ProviderConnection>> {
        self.providers
            .iter()
            .find(|provider| provider.provider_id() == provider_id)
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|poisoned| {
            tracing::error!("tool registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Merges the catalogues of connected providers, in configuration order.
    fn rebuild_registry(&self) -> RegistrySnapshot {
        let mut merged = Registry::default();
        for provider in self.providers.iter().filter(|p| p.is_connected()) {
            let provider_id = provider.provider_id();
            for tool in provider.tools() {
                let name = match self.config.collision_policy {
                    CollisionPolicy::LastWins => tool.name.clone(),
                    CollisionPolicy::Namespace => {
                        format!("{provider_id}{NAMESPACE_SEPARATOR}{}", tool.name)
                    }
                };
                if let Some(previous) = merged.routes.get(&name) {
                    tracing::warn!(
                        tool = %name,
                        previous = %previous.provider_id,
                        provider = %provider_id,
                        "tool name collision, later provider wins"
                    );
                }
                merged.routes.insert(
                    name.clone(),
                    Route {
                        provider_id: provider_id.to_string(),
                        tool_name: tool.name.clone(),
                    },
                );
                merged
                    .descriptors
                    .insert(name.clone(), ToolDescriptor { name, ..tool });
            }
        }

        let snapshot = RegistrySnapshot::new(
            merged.descriptors.values().cloned().collect(),
            self.providers
                .iter()
                .map(|p| p.provider_id().to_string())
                .collect(),
        );
        *self.registry.write().unwrap_or_else(|poisoned| {
            tracing::error!("tool registry lock poisoned, recovering");
            poisoned.into_inner()
        }) = merged;
        snapshot
    }

    fn publish_registry(&self, snapshot: &RegistrySnapshot) {
        match self.bus.publish_json_retained(topics::TOOL_REGISTRY, snapshot) {
            Ok(_) => tracing::debug!(tools = snapshot.tool_count, "tool registry published"),
            Err(e) => tracing::warn!(error = %e, "failed to publish tool registry"),
        }
    }

    /// Disconnects and reconnects one provider, then republishes the
    /// registry. Returns the provider's new tool count.
    ///
    /// # Errors
    ///
    /// [`GatewayError::UnknownProvider`] for an unconfigured id, otherwise
    /// the connection or discovery error. The registry is republished
    /// either way.
    pub async fn reconnect_provider(&self, provider_id: &str) -> Result<usize, GatewayError> {
        let provider = self
            .provider(provider_id)
            .ok_or_else(|| GatewayError::UnknownProvider(provider_id.to_string()))?;

        tracing::info!(provider = provider_id, "reconnecting provider");
        provider.disconnect().await;
        let outcome = connect_and_discover(provider).await;
        if outcome.is_err() {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }

        let snapshot = self.rebuild_registry();
        self.publish_registry(&snapshot);
        outcome
    }

    /// Descriptor of a registry tool, including its input schema.
    pub fn tool_schema(&self, tool_name: &str) -> Option<ToolDescriptor> {
        self.read_registry().descriptors.get(tool_name).cloned()
    }

    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        let registry = self.read_registry();
        RegistrySnapshot::new(
            registry.descriptors.values().cloned().collect(),
            self.providers
                .iter()
                .map(|p| p.provider_id().to_string())
                .collect(),
        )
    }

    pub fn providers_status(&self) -> ProvidersReport {
        ProvidersReport {
            providers: self
                .providers
                .iter()
                .map(|p| ProviderStatus {
                    provider_id: p.provider_id().to_string(),
                    connected: p.is_connected(),
                    tool_count: p.tool_count(),
                })
                .collect(),
        }
    }

    fn connected_count(&self) -> usize {
        self.providers.iter().filter(|p| p.is_connected()).count()
    }

    /// Healthy when no providers are configured or at least one is connected.
    pub fn is_healthy(&self) -> bool {
        self.providers.is_empty() || self.connected_count() > 0
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
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

    pub fn metrics(&self) -> GatewayMetrics {
        let connected_providers: Vec<String> = self
            .providers
            .iter()
            .filter(|p| p.is_connected())
            .map(|p| p.provider_id().to_string())
            .collect();
        GatewayMetrics {
            service: SERVICE_NAME.to_string(),
            tool_call_count: self.tool_call_count(),
            total_tools: self.read_registry().descriptors.len(),
            providers_configured: self.providers.len(),
            providers_connected: connected_providers.len(),
            connected_providers,
            error_count: self.error_count(),
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
            tracing::warn!(error = %e, "failed to publish gateway metrics");
        }
    }

    fn publish_status(&self, state: ServiceState) {
        let status = ServiceStatus::new(SERVICE_NAME, state, self.is_healthy(), self.is_running())
            .with_uptime(self.uptime_seconds())
            .with_error_count(self.error_count())
            .with_details(json!({
                "providers_configured": self.providers.len(),
                "providers_connected": self.connected_count(),
                "tool_count": self.read_registry().descriptors.len(),
            }));
        if let Err(e) = self
            .bus
            .publish_json(&topics::service_status(SERVICE_NAME), &status)
        {
            tracing::warn!(error = %e, "failed to publish gateway status");
        }
    }

    /// Stops answering requests, aborts in-flight calls, disconnects every
    /// provider and publishes the now-empty registry, final status and
    /// metrics. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("stopping tool gateway");

        recover(self.listeners.lock(), "listeners").clear();
        let mut in_flight = std::mem::take(&mut *recover(self.in_flight.lock(), "in_flight"));
        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}

        futures_util::future::join_all(self.providers.iter().map(|p| p.disconnect())).await;

        let snapshot = self.rebuild_registry();
        self.publish_registry(&snapshot);
        self.publish_status(ServiceState::Stopped);
        self.publish_metrics();
        tracing::info!(tool_calls = self.tool_call_count(), "tool gateway stopped");
    }
}

/// Connects and discovers one provider. A provider whose discovery fails is
/// disconnected so it stays out of the registry.
async fn connect_and_discover(provider: &ProviderConnection) -> Result<usize, GatewayError> {
    provider.connect().await?;
    match provider.discover_tools().await {
        Ok(tools) => Ok(tools.len()),
        Err(e) => {
            provider.disconnect().await;
            Err(e)
        }
    }
}
