//! The engine's view of the tool registry.
//!
//! The gateway publishes its merged registry as a retained message, so the
//! catalogue can be built whenever the engine starts, before or after the
//! gateway, and a subscription keeps it current from then on.

use crate::chat::ToolSpec;
use freya_bus::{BusError, Listener, MessageBus};
use freya_types::{topics, RegistrySnapshot, ToolDescriptor};
use serde_json::Value;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Shared {
    snapshot: RwLock<RegistrySnapshot>,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, RegistrySnapshot> {
        self.snapshot.read().unwrap_or_else(|poisoned| {
            tracing::error!("tool catalogue lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistrySnapshot> {
        self.snapshot.write().unwrap_or_else(|poisoned| {
            tracing::error!("tool catalogue lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Replaces the snapshot. Malformed payloads keep the previous one.
    fn apply(&self, payload: Value) {
        match serde_json::from_value::<RegistrySnapshot>(payload) {
            Ok(snapshot) => {
                tracing::info!(tools = snapshot.tool_count, "tool registry updated");
                tracing::debug!(
                    tools = ?snapshot.tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
                    "available tools"
                );
                *self.write() = snapshot;
            }
            Err(e) => tracing::warn!(error = %e, "ignoring malformed tool registry"),
        }
    }
}

/// Tools currently routable through the gateway.
pub struct ToolCatalog {
    bus: MessageBus,
    shared: Arc<Shared>,
    _listener: Listener,
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCatalog")
            .field("tool_count", &self.len())
            .finish()
    }
}

impl ToolCatalog {
    /// Loads the retained registry, if any, and subscribes for updates.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the subscription fails.
    pub fn new(bus: MessageBus) -> Result<Self, BusError> {
        let shared = Arc::new(Shared::default());
        if let Some(retained) = bus.retained(topics::TOOL_REGISTRY) {
            shared.apply(retained);
        }

        let updates = shared.clone();
        let listener = bus.listen(topics::TOOL_REGISTRY, move |envelope| {
            updates.apply(envelope.payload);
            std::future::ready(())
        })?;

        Ok(Self {
            bus,
            shared,
            _listener: listener,
        })
    }

    /// Re-reads the retained registry from the bus.
    pub fn refresh(&self) {
        if let Some(retained) = self.bus.retained(topics::TOOL_REGISTRY) {
            self.shared.apply(retained);
        }
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.shared.read().tools.clone()
    }

    /// Tools in the form offered to the model.
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.shared.read().tools.iter().map(ToolSpec::from).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.shared.read().get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.shared.read().tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
