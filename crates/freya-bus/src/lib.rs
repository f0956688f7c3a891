//! Message bus and request/response correlation for the Freya runtime.
//!
//! Services never talk to each other directly: they publish JSON objects on
//! named topics and subscribe to the topics they care about. This crate
//! provides the in-process broker that carries those messages and the
//! [`Correlator`], which layers RPC semantics (request id, awaited reply,
//! deadline) on top of it.
//!
//! # Usage
//!
//! ```rust,ignore
//! use freya_bus::{Correlator, MessageBus};
//! use freya_types::topics;
//!
//! let bus = MessageBus::new();
//! let correlator = Correlator::new(bus.clone(), topics::TOOL_CALL_RESULT)?;
//!
//! let mut request = serde_json::Map::new();
//! request.insert("tool_name".into(), "get_weather".into());
//! let result = correlator
//!     .call(topics::TOOL_CALL_REQUEST, request, Duration::from_secs(5))
//!     .await?;
//! ```

mod broker;
mod correlation;
mod error;

pub use broker::{Envelope, Listener, MessageBus, Subscription};
pub use correlation::{Correlator, REQUEST_ID_FIELD};
pub use error::{BusError, CorrelationError};

#[cfg(test)]
mod tests;
