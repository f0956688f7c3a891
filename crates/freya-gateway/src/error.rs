use freya_bus::BusError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by provider connections and the tool gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("failed to connect to provider {provider_id}: {reason}")]
    Connection { provider_id: String, reason: String },

    #[error("tool discovery failed for provider {provider_id}: {reason}")]
    Discovery { provider_id: String, reason: String },

    #[error("tool '{0}' not found")]
    ToolNotFound(String),

    #[error("tool '{tool}' failed: {reason}")]
    Invocation { tool: String, reason: String },

    #[error("provider {0} is not connected")]
    NotConnected(String),

    #[error("tool '{tool}' timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("protocol error from provider {provider_id}: {reason}")]
    Protocol { provider_id: String, reason: String },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}
