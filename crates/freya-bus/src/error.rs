//! Error types for the message bus and correlation layer.

use std::time::Duration;

/// Errors raised by [`crate::MessageBus`] operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Topic names must be non-empty.
    #[error("invalid topic name: {0:?}")]
    InvalidTopic(String),

    /// Payloads must be JSON objects.
    #[error("invalid payload for topic {topic}: {reason}")]
    InvalidPayload {
        /// Topic the payload was published to.
        topic: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The bus has been shut down.
    #[error("message bus is shut down")]
    Closed,

    /// A payload could not be serialized.
    #[error("bus serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by [`crate::Correlator::call`].
#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    /// No matching result arrived before the deadline.
    #[error("no result for request {request_id} within {timeout:?}")]
    Timeout {
        /// Correlation token of the abandoned request.
        request_id: String,
        /// Deadline that expired.
        timeout: Duration,
    },

    /// Publishing the request failed.
    #[error("correlation publish failed: {0}")]
    Bus(#[from] BusError),

    /// The result dispatcher stopped before a result arrived.
    #[error("correlation dispatcher closed before request {0} completed")]
    Closed(String),

    /// A result arrived but could not be decoded.
    #[error("invalid correlated result: {0}")]
    InvalidPayload(String),
}

impl CorrelationError {
    /// Returns true for deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
