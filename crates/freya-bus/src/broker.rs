//! In-process publish/subscribe broker.
//!
//! Each subscription owns an unbounded FIFO queue, so a single subscriber sees
//! messages on one topic in publish order. Nothing is ordered across topics.
//! Retained topics keep their last payload, which is replayed to every new
//! subscriber and can be read on demand with [`MessageBus::retained`].

use crate::error::BusError;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Topic the message was published on.
    pub topic: String,
    /// JSON object payload.
    pub payload: Value,
}

#[derive(Default)]
struct TopicState {
    subscribers: Vec<(u64, mpsc::UnboundedSender<Envelope>)>,
    retained: Option<Value>,
}

#[derive(Default)]
struct BusInner {
    topics: RwLock<HashMap<String, TopicState>>,
    next_subscriber: AtomicU64,
    closed: AtomicBool,
}

impl BusInner {
    // Lock sections below never span an `.await`, so a std lock is enough.
    // A poisoned lock only means a panic happened mid-update of a routing
    // table; keep serving with whatever state is there.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TopicState>> {
        self.topics.read().unwrap_or_else(|poisoned| {
            tracing::error!("bus topic table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TopicState>> {
        self.topics.write().unwrap_or_else(|poisoned| {
            tracing::error!("bus topic table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn remove_subscriber(&self, topic: &str, id: u64) {
        let mut topics = self.write();
        if let Some(state) = topics.get_mut(topic) {
            state.subscribers.retain(|(sub_id, _)| *sub_id != id);
            if state.subscribers.is_empty() && state.retained.is_none() {
                topics.remove(topic);
            }
        }
    }
}

/// Handle to the shared message bus. Cheap to clone.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("topics", &self.inner.read().len())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl MessageBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `payload` to every current subscriber of `topic`.
    ///
    /// Returns the number of subscribers the message was queued for.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the topic is empty, the payload is not a JSON
    /// object, or the bus has been shut down.
    pub fn publish(&self, topic: &str, payload: Value) -> Result<usize, BusError> {
        self.deliver(topic, payload, false)
    }

    /// Publishes `payload` and keeps it as the topic's retained value.
    ///
    /// # Errors
    ///
    /// Same as [`MessageBus::publish`].
    pub fn publish_retained(&self, topic: &str, payload: Value) -> Result<usize, BusError> {
        self.deliver(topic, payload, true)
    }

    /// Serializes `message` and publishes it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] if `message` cannot be encoded,
    /// otherwise the same as [`MessageBus::publish`].
    pub fn publish_json<T: Serialize>(&self, topic: &str, message: &T) -> Result<usize, BusError> {
        self.publish(topic, serde_json::to_value(message)?)
    }

    /// Serializes `message` and publishes it as the retained value.
    ///
    /// # Errors
    ///
    /// Same as [`MessageBus::publish_json`].
    pub fn publish_json_retained<T: Serialize>(
        &self,
        topic: &str,
        message: &T,
    ) -> Result<usize, BusError> {
        self.publish_retained(topic, serde_json::to_value(message)?)
    }

    fn deliver(&self, topic: &str, payload: Value, retain: bool) -> Result<usize, BusError> {
        validate_topic(topic)?;
        if !payload.is_object() {
            return Err(BusError::InvalidPayload {
                topic: topic.to_string(),
                reason: "payload must be a JSON object".to_string(),
            });
        }
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let mut topics = self.inner.write();
        let state = if retain {
            let state = topics.entry(topic.to_string()).or_default();
            state.retained = Some(payload.clone());
            state
        } else {
            match topics.get_mut(topic) {
                Some(state) => state,
                None => {
                    tracing::trace!(topic, "published with no subscribers");
                    return Ok(0);
                }
            }
        };

        let envelope = Envelope {
            topic: topic.to_string(),
            payload,
        };
        let before = state.subscribers.len();
        state
            .subscribers
            .retain(|(_, tx)| tx.send(envelope.clone()).is_ok());
        let delivered = state.subscribers.len();
        if delivered < before {
            tracing::debug!(topic, pruned = before - delivered, "pruned closed subscribers");
        }
        tracing::trace!(topic, delivered, "published");
        Ok(delivered)
    }

    /// Returns the retained value of `topic`, if any.
    pub fn retained(&self, topic: &str) -> Option<Value> {
        self.inner
            .read()
            .get(topic)
            .and_then(|state| state.retained.clone())
    }

    /// Subscribes to `topic`.
    ///
    /// If the topic has a retained value it is queued first. The subscription
    /// is removed from the bus when the returned handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the topic is empty or the bus is shut down.
    pub fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        validate_topic(topic)?;
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut topics = self.inner.write();
        let state = topics.entry(topic.to_string()).or_default();
        if let Some(retained) = &state.retained {
            // The receiver is alive, so this cannot fail.
            let _ = tx.send(Envelope {
                topic: topic.to_string(),
                payload: retained.clone(),
            });
        }
        state.subscribers.push((id, tx));
        tracing::debug!(topic, subscriber = id, "subscribed");

        Ok(Subscription {
            id,
            topic: topic.to_string(),
            rx,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Subscribes to `topic` and runs `handler` for every message on a
    /// background task, one message at a time.
    ///
    /// The task stops when the returned [`Listener`] is dropped or aborted, or
    /// when the bus shuts down.
    ///
    /// # Errors
    ///
    /// Same as [`MessageBus::subscribe`].
    pub fn listen<F, Fut>(&self, topic: &str, handler: F) -> Result<Listener, BusError>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut subscription = self.subscribe(topic)?;
        let topic = topic.to_string();
        let task = tokio::spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                handler(envelope).await;
            }
            tracing::debug!(topic = %topic, "listener stopped");
        });
        Ok(Listener { task })
    }

    /// Returns the number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .read()
            .get(topic)
            .map_or(0, |state| state.subscribers.len())
    }

    /// Returns true once [`MessageBus::shutdown`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Shuts the bus down.
    ///
    /// Every subscription stream ends after draining already-queued messages
    /// and further publishes fail with [`BusError::Closed`]. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut topics = self.inner.write();
        let count = topics.len();
        topics.clear();
        tracing::info!(topics = count, "message bus shut down");
    }
}

fn validate_topic(topic: &str) -> Result<(), BusError> {
    if topic.trim().is_empty() {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// A live subscription to one topic.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Waits for the next message. Returns `None` once the bus shuts down.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Returns the next queued message without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Topic this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_subscriber(&self.topic, self.id);
        }
    }
}

/// Background task spawned by [`MessageBus::listen`]. Aborted on drop.
#[derive(Debug)]
pub struct Listener {
    task: JoinHandle<()>,
}

impl Listener {
    /// Stops the listener.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Returns true once the listener task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
