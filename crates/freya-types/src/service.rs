//! Service status and metric envelopes.
//!
//! Every service publishes these on `service.<name>.status` and
//! `service.<name>.metrics`. The payloads are informational only; nothing in
//! the runtime core reacts to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state reported in a [`ServiceStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// The service finished startup.
    Started,
    /// The service shut down.
    Stopped,
    /// Periodic liveness report.
    Healthy,
    /// The service is running but degraded.
    Degraded,
    /// The service hit an error worth surfacing.
    Error,
}

impl ServiceState {
    /// Returns the wire label for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status envelope published on `service.<name>.status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Service name, e.g. `tool_gateway`.
    pub service: String,
    /// Reported lifecycle state.
    pub status: ServiceState,
    /// Whether the service considers itself healthy.
    pub healthy: bool,
    /// Whether the service is running.
    pub running: bool,
    /// When the report was produced.
    pub timestamp: DateTime<Utc>,
    /// Seconds since the service started, if it has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<f64>,
    /// Errors counted since start, omitted when zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u64>,
    /// Free-form details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ServiceStatus {
    /// Builds a status envelope stamped with the current time.
    pub fn new(service: impl Into<String>, status: ServiceState, healthy: bool, running: bool) -> Self {
        Self {
            service: service.into(),
            status,
            healthy,
            running,
            timestamp: Utc::now(),
            uptime_seconds: None,
            error_count: None,
            details: None,
        }
    }

    /// Attaches the uptime.
    pub fn with_uptime(mut self, uptime_seconds: Option<f64>) -> Self {
        self.uptime_seconds = uptime_seconds;
        self
    }

    /// Attaches the error count; zero is omitted from the payload.
    pub fn with_error_count(mut self, error_count: u64) -> Self {
        self.error_count = (error_count > 0).then_some(error_count);
        self
    }

    /// Attaches free-form details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}
