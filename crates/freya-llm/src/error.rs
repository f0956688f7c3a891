use freya_bus::{BusError, CorrelationError};
use freya_resilience::{CircuitError, RetryError};
use std::time::Duration;
use thiserror::Error;

/// Errors from a single language-model call.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid model response: {0}")]
    Decode(String),

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
}

impl ModelError {
    /// Transient failures worth another attempt: transport errors, timeouts,
    /// rate limiting and server-side errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_decode() && !e.is_builder(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) => false,
            Self::Timeout(_) => true,
        }
    }
}

/// Errors from a reasoning turn.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model circuit '{name}' is open, retry in {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("model unavailable after {attempts} attempts: {source}")]
    RetryExhausted { attempts: u32, source: ModelError },

    #[error(transparent)]
    Model(ModelError),

    #[error("tool '{tool}' failed: {reason}")]
    Tool { tool: String, reason: String },

    #[error("tool '{tool}' timed out after {timeout:?}")]
    ToolTimeout { tool: String, timeout: Duration },

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl EngineError {
    /// True when the turn failed because a deadline expired.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::ToolTimeout { .. } => true,
            Self::Model(e) | Self::RetryExhausted { source: e, .. } => {
                matches!(e, ModelError::Timeout(_))
            }
            Self::Correlation(e) => e.is_timeout(),
            _ => false,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl From<RetryError<CircuitError<ModelError>>> for EngineError {
    fn from(err: RetryError<CircuitError<ModelError>>) -> Self {
        match err {
            RetryError::Exhausted {
                attempts,
                source: CircuitError::Inner(source),
            } => Self::RetryExhausted { attempts, source },
            RetryError::Exhausted {
                source: CircuitError::Open { name, retry_after },
                ..
            }
            | RetryError::Aborted(CircuitError::Open { name, retry_after }) => {
                Self::CircuitOpen { name, retry_after }
            }
            RetryError::Aborted(CircuitError::Inner(source)) => Self::Model(source),
        }
    }
}
