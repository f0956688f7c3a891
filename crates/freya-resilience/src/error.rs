//! Error types for the circuit breaker and retry policy.

use std::time::Duration;

/// Outcome of a call made through a [`crate::CircuitBreaker`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the operation was not attempted.
    #[error("circuit breaker '{name}' is open, retry in {retry_after:?}")]
    Open {
        /// Dependency name of the breaker.
        name: String,
        /// Time left until the next probe is allowed.
        retry_after: Duration,
    },

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// Returns true if the call was rejected without being attempted.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Returns the operation's own error, if it ran.
    pub fn inner(&self) -> Option<&E> {
        match self {
            Self::Open { .. } => None,
            Self::Inner(e) => Some(e),
        }
    }
}

/// Outcome of an operation run through a [`crate::RetryPolicy`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        /// Total attempts made, including the first.
        attempts: u32,
        /// Error from the last attempt.
        source: E,
    },

    /// An attempt failed with an error outside the retry allow-list.
    #[error(transparent)]
    Aborted(E),
}

impl<E> RetryError<E> {
    /// Returns the last underlying error.
    pub fn last_error(&self) -> &E {
        match self {
            Self::Exhausted { source, .. } => source,
            Self::Aborted(e) => e,
        }
    }

    /// Consumes the error and returns the last underlying error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { source, .. } => source,
            Self::Aborted(e) => e,
        }
    }

    /// Returns true if all attempts were used up.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}
