//! Runtime configuration loading from file and environment variables.

use freya_gateway::GatewayConfig;
use freya_llm::LlmConfig;
use freya_resilience::{CircuitBreakerConfig, RetryPolicy};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Tool gateway and capability providers.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Language model settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Circuit breaker settings shared by every guarded dependency.
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,

    /// Retry policy for model calls.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Correlated request settings.
    #[serde(default)]
    pub correlation: CorrelationConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "freya_gateway=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationConfig {
    /// How long a tool call may take end to end, in seconds.
    #[serde(default = "default_correlation_timeout_secs")]
    pub timeout_secs: f64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_correlation_timeout_secs() -> f64 {
    30.0
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_correlation_timeout_secs(),
        }
    }
}

impl CorrelationConfig {
    /// Tool call deadline. Non-positive values fall back to the default.
    pub fn timeout(&self) -> Duration {
        if self.timeout_secs.is_finite() && self.timeout_secs > 0.0 {
            Duration::try_from_secs_f64(self.timeout_secs)
                .unwrap_or(Duration::from_secs(30))
        } else {
            Duration::from_secs_f64(default_correlation_timeout_secs())
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides (see [`apply_env_overrides`]).
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    Ok(apply_env_overrides(config, |key| std::env::var(key).ok()))
}

/// Applies `FREYA_*` overrides read through `lookup`:
///
/// - `FREYA_HOST` overrides `server.host`
/// - `FREYA_PORT` overrides `server.port`
/// - `FREYA_LOG_LEVEL` overrides `logging.level`
/// - `FREYA_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `FREYA_OLLAMA_HOST` overrides `llm.host`
/// - `FREYA_OLLAMA_MODEL` overrides `llm.model`
/// - `FREYA_GATEWAY_ENABLED` overrides `gateway.enabled`
/// - `FREYA_TOOL_TIMEOUT_SECS` overrides `correlation.timeout_secs`
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides<F>(mut config: Config, lookup: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("FREYA_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("FREYA_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(level) = lookup("FREYA_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("FREYA_LOG_JSON") {
        config.logging.json = is_truthy(&json);
    }
    if let Some(host) = lookup("FREYA_OLLAMA_HOST") {
        config.llm.host = host;
    }
    if let Some(model) = lookup("FREYA_OLLAMA_MODEL") {
        config.llm.model = model;
    }
    if let Some(enabled) = lookup("FREYA_GATEWAY_ENABLED") {
        config.gateway.enabled = is_truthy(&enabled);
    }
    if let Some(timeout) = lookup("FREYA_TOOL_TIMEOUT_SECS") {
        if let Ok(parsed) = timeout.parse() {
            config.correlation.timeout_secs = parsed;
        }
    }
    config
}

fn is_truthy(value: &str) -> bool {
    value == "true" || value == "1"
}
