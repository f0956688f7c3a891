//! Gateway and provider configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// One capability provider process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Identifier used in logs, the registry and namespaced tool names.
    pub provider_id: String,

    /// Executable to launch (e.g. "npx", "node", "/usr/local/bin/weather-mcp").
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the provider process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// How to handle two providers advertising the same tool name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// The provider merged last owns the name. A warning is logged.
    #[default]
    LastWins,
    /// Every tool is registered as `<provider_id>__<tool>`.
    Namespace,
}

/// Tool gateway settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub collision_policy: CollisionPolicy,

    /// Deadline for requests that do not carry their own.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: f64,

    /// Log every tool call at info level (debug otherwise).
    #[serde(default = "default_true")]
    pub log_tool_calls: bool,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> f64 {
    30.0
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            providers: Vec::new(),
            collision_policy: CollisionPolicy::default(),
            default_timeout_secs: default_timeout_secs(),
            log_tool_calls: true,
        }
    }
}

impl GatewayConfig {
    pub fn default_timeout(&self) -> Duration {
        secs_to_duration(self.default_timeout_secs).unwrap_or(Duration::from_secs(30))
    }

    /// Providers that should be connected at startup.
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

/// Converts a positive, finite number of seconds to a [`Duration`].
pub(crate) fn secs_to_duration(secs: f64) -> Option<Duration> {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}
