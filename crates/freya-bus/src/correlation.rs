//! Request/response correlation over the bus.
//!
//! A [`Correlator`] turns the fire-and-forget bus into an RPC channel: it tags
//! each outgoing request with a fresh `request_id`, parks a oneshot slot for
//! it, and resolves that slot when a message carrying the same id shows up on
//! the result topic. All in-flight calls share one result subscription.
//!
//! Slots are removed on every exit path (result, timeout, publish failure, or
//! the caller dropping the future), so the pending table only ever holds calls
//! that are genuinely waiting. Results that arrive for unknown ids (late,
//! duplicated, or addressed to another correlator) are dropped.

use crate::broker::{Envelope, Listener, MessageBus};
use crate::error::CorrelationError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Field carrying the correlation token in requests and results.
pub const REQUEST_ID_FIELD: &str = "request_id";

#[derive(Clone, Default)]
struct PendingTable {
    slots: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Value>>> {
        self.slots.lock().unwrap_or_else(|poisoned| {
            tracing::error!("pending result table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Inserts a slot under a fresh id and returns the id with its guard.
    fn register(&self, tx: oneshot::Sender<Value>) -> (String, PendingGuard) {
        let mut slots = self.lock();
        let mut request_id = Uuid::new_v4().to_string();
        while slots.contains_key(&request_id) {
            request_id = Uuid::new_v4().to_string();
        }
        slots.insert(request_id.clone(), tx);
        let guard = PendingGuard {
            table: self.clone(),
            request_id: request_id.clone(),
        };
        (request_id, guard)
    }

    fn take(&self, request_id: &str) -> Option<oneshot::Sender<Value>> {
        self.lock().remove(request_id)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }
}

/// Removes its slot from the pending table when dropped.
struct PendingGuard {
    table: PendingTable,
    request_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.take(&self.request_id);
    }
}

/// RPC client over one result topic.
pub struct Correlator {
    bus: MessageBus,
    result_topic: String,
    pending: PendingTable,
    _dispatcher: Listener,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("result_topic", &self.result_topic)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Correlator {
    /// Creates a correlator and subscribes it to `result_topic`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::Bus`] if the subscription fails.
    pub fn new(bus: MessageBus, result_topic: &str) -> Result<Self, CorrelationError> {
        let pending = PendingTable::default();
        let table = pending.clone();
        let dispatcher = bus.listen(result_topic, move |envelope| {
            dispatch(&table, envelope);
            std::future::ready(())
        })?;

        tracing::debug!(result_topic, "correlator subscribed");
        Ok(Self {
            bus,
            result_topic: result_topic.to_string(),
            pending,
            _dispatcher: dispatcher,
        })
    }

    /// Publishes `payload` on `request_topic` and waits for the matching
    /// result.
    ///
    /// The `request_id` field of `payload` is overwritten with a fresh token.
    /// Returns the full result payload.
    ///
    /// # Errors
    ///
    /// - [`CorrelationError::Timeout`] if nothing matching arrives in time.
    /// - [`CorrelationError::Bus`] if the request cannot be published.
    /// - [`CorrelationError::Closed`] if the dispatcher stops first.
    pub async fn call(
        &self,
        request_topic: &str,
        mut payload: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, CorrelationError> {
        let (tx, rx) = oneshot::channel();
        // Registered before publishing so a fast reply cannot miss its slot.
        let (request_id, _guard) = self.pending.register(tx);
        payload.insert(
            REQUEST_ID_FIELD.to_string(),
            Value::String(request_id.clone()),
        );

        self.bus.publish(request_topic, Value::Object(payload))?;
        tracing::debug!(%request_id, request_topic, ?timeout, "correlated request published");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(CorrelationError::Closed(request_id)),
            Err(_) => {
                tracing::warn!(%request_id, request_topic, ?timeout, "correlated request timed out");
                Err(CorrelationError::Timeout {
                    request_id,
                    timeout,
                })
            }
        }
    }

    /// Number of calls currently waiting for a result.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns true while a call with `request_id` is waiting.
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains(request_id)
    }

    /// Topic this correlator reads results from.
    pub fn result_topic(&self) -> &str {
        &self.result_topic
    }
}

fn dispatch(pending: &PendingTable, envelope: Envelope) {
    let Some(request_id) = envelope
        .payload
        .get(REQUEST_ID_FIELD)
        .and_then(Value::as_str)
        .map(str::to_owned)
    else {
        tracing::debug!(topic = %envelope.topic, "discarding result without request_id");
        return;
    };

    match pending.take(&request_id) {
        Some(slot) => {
            if slot.send(envelope.payload).is_err() {
                tracing::debug!(%request_id, "caller gave up before result was delivered");
            }
        }
        None => {
            tracing::debug!(%request_id, "discarding uncorrelated or late result");
        }
    }
}
