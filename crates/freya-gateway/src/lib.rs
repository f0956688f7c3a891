//! Tool-invocation gateway for the Freya runtime.
//!
//! The gateway is the only component that talks to capability providers
//! (MCP servers). It connects to every configured provider at startup,
//! merges their tool catalogues into one registry, publishes that registry
//! as a retained message on `tool.registry`, and answers each correlated
//! `tool.call.request` with exactly one `tool.call.result`.
//!
//! Provider failures are isolated: a provider that cannot be reached is
//! logged and left out of the registry, and a failing tool call becomes a
//! `success: false` result rather than an error on the bus.

pub mod config;
pub mod error;
pub mod gateway;
pub mod provider;

pub use config::{CollisionPolicy, GatewayConfig, ProviderConfig};
pub use error::GatewayError;
pub use gateway::{GatewayMetrics, ToolGateway, NAMESPACE_SEPARATOR, SERVICE_NAME};
pub use provider::{
    ProviderConnection, ProviderTransport, StdioTransport, TransportChannel, MAX_MESSAGE_BYTES,
    PROTOCOL_VERSION,
};
