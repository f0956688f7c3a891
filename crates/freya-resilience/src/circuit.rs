//! Circuit breaker for calls to a failing dependency.
//!
//! ```text
//!            failures >= failure_threshold
//!   Closed ──────────────────────────────▶ Open
//!     ▲                                     │ recovery_timeout elapsed,
//!     │ successes >= success_threshold      ▼ next call
//!     └────────────────────────────── HalfOpen ──(probe fails)──▶ Open
//! ```
//!
//! Only one probe runs at a time while half-open; other callers are rejected
//! as if the circuit were still open.

use crate::error::CircuitError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected without being attempted.
    Open,
    /// A probe is allowed through to test recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> f64 {
    30.0
}

fn default_success_threshold() -> u32 {
    2
}

/// Thresholds shared by every breaker built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before allowing a probe.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: f64,
    /// Consecutive half-open successes that close the circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.recovery_timeout_secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Point-in-time view of a breaker, as served by the introspection API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
    /// Seconds since the circuit last opened, while open or half-open.
    pub open_for_secs: Option<f64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Per-dependency circuit breaker. Share it behind an [`Arc`].
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

enum Outcome {
    Success,
    Failure,
    Ignored,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!(breaker = %self.name, "circuit breaker lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Current state. Does not advance an expired open circuit; that
    /// happens on the next call.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Runs `op` through the breaker, counting every error as a failure.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Open`] without running `op` if the circuit is
    /// open, or [`CircuitError::Inner`] with the operation's own error.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(op, |_| true).await
    }

    /// Runs `op` through the breaker. Errors for which `is_failure` returns
    /// false are passed through without touching the counters.
    ///
    /// # Errors
    ///
    /// Same as [`CircuitBreaker::call`].
    pub async fn call_with<F, Fut, T, E, C>(&self, op: F, is_failure: C) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let permit = self.acquire::<E>()?;
        let result = op().await;
        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) if is_failure(e) => Outcome::Failure,
            Err(_) => Outcome::Ignored,
        };
        permit.settle(outcome);
        result.map_err(CircuitError::Inner)
    }

    fn acquire<E>(&self) -> Result<Permit<'_>, CircuitError<E>> {
        let mut state = self.lock();
        if state.state == CircuitState::Open {
            let recovery = self.config.recovery_timeout();
            let elapsed = state.opened_at.map_or(recovery, |at| at.elapsed());
            if elapsed < recovery {
                return Err(CircuitError::Open {
                    name: self.name.clone(),
                    retry_after: recovery - elapsed,
                });
            }
            state.state = CircuitState::HalfOpen;
            state.success_count = 0;
            tracing::info!(breaker = %self.name, "circuit half-open, probing");
        }

        match state.state {
            CircuitState::HalfOpen if state.probe_in_flight => Err(CircuitError::Open {
                name: self.name.clone(),
                retry_after: Duration::ZERO,
            }),
            CircuitState::HalfOpen => {
                state.probe_in_flight = true;
                Ok(Permit {
                    breaker: self,
                    probe: true,
                    settled: false,
                })
            }
            _ => Ok(Permit {
                breaker: self,
                probe: false,
                settled: false,
            }),
        }
    }

    fn record(&self, probe: bool, outcome: Outcome) {
        let mut state = self.lock();
        if probe {
            state.probe_in_flight = false;
        }

        match (state.state, outcome) {
            (_, Outcome::Ignored) => {}
            (CircuitState::Closed, Outcome::Success) => state.failure_count = 0,
            (CircuitState::Closed, Outcome::Failure) => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    self.open(&mut state);
                    tracing::error!(
                        breaker = %self.name,
                        failures = self.config.failure_threshold,
                        retry_in_secs = self.config.recovery_timeout_secs,
                        "circuit opened"
                    );
                }
            }
            // Calls admitted while closed may finish after the state moved on;
            // only the probe decides a half-open circuit.
            (CircuitState::HalfOpen, _) if !probe => {}
            (CircuitState::HalfOpen, Outcome::Success) => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    *state = BreakerState::closed();
                    tracing::info!(breaker = %self.name, "circuit closed, dependency recovered");
                }
            }
            (CircuitState::HalfOpen, Outcome::Failure) => {
                self.open(&mut state);
                tracing::warn!(breaker = %self.name, "probe failed, circuit reopened");
            }
            (CircuitState::Open, _) => {}
        }
    }

    fn open(&self, state: &mut BreakerState) {
        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        state.failure_count = 0;
        state.success_count = 0;
    }

    /// Forces the circuit closed and clears all counters.
    pub fn reset(&self) {
        *self.lock() = BreakerState::closed();
        tracing::info!(breaker = %self.name, "circuit manually reset");
    }

    pub fn stats(&self) -> CircuitStats {
        let state = self.lock();
        CircuitStats {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_secs: self.config.recovery_timeout_secs,
            open_for_secs: state.opened_at.map(|at| at.elapsed().as_secs_f64()),
        }
    }
}

/// Admission ticket for one call. Dropping it unsettled (the caller's future
/// was cancelled) only releases the probe slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(self.probe, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.lock().probe_in_flight = false;
            tracing::debug!(breaker = %self.breaker.name, "probe cancelled");
        }
    }
}

/// Named breakers sharing one configuration, created on first use.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|poisoned| {
            tracing::error!("breaker registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Returns the breaker for `name`, creating it if needed.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Stats of every breaker, sorted by name.
    pub fn stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<_> = self.lock().values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        for breaker in self.lock().values() {
            breaker.reset();
        }
    }
}
