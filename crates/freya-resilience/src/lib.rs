//! Failure isolation primitives: circuit breaker and retry with backoff.
//!
//! Both wrap arbitrary async operations and are generic over the operation's
//! error type. They compose through [`retry_through`], which never retries a
//! call rejected by an open circuit.

pub mod circuit;
pub mod error;
pub mod retry;

pub use circuit::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use error::{CircuitError, RetryError};
pub use retry::{retry_through, RetryPolicy};
