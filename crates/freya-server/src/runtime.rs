//! Wiring of the bus, tool gateway and reasoning engine.

use crate::config::Config;
use crate::AppState;
use freya_bus::MessageBus;
use freya_gateway::{GatewayError, ToolGateway};
use freya_llm::{EngineError, ModelClient, OllamaClient, ReasoningEngine, MODEL_BREAKER};
use freya_resilience::BreakerRegistry;
use std::sync::Arc;
use thiserror::Error;

/// Errors that stop the runtime from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("tool gateway failed to start: {0}")]
    Gateway(#[from] GatewayError),

    #[error("reasoning engine failed to start: {0}")]
    Engine(#[from] EngineError),
}

async fn start_engine(
    config: &Config,
    bus: &MessageBus,
    breakers: &BreakerRegistry,
    model: Arc<dyn ModelClient>,
) -> Result<Arc<ReasoningEngine>, EngineError> {
    let engine = ReasoningEngine::new(bus.clone(), model, config.llm.clone())?
        .with_breaker(breakers.get(MODEL_BREAKER))
        .with_retry(config.retry.clone())
        .with_tool_timeout(config.correlation.timeout());
    let engine = Arc::new(engine);
    engine.start().await?;
    Ok(engine)
}

/// The running services.
#[derive(Debug)]
pub struct Runtime {
    state: AppState,
}

impl Runtime {
    /// Starts every service with an Ollama model client.
    ///
    /// # Errors
    ///
    /// See [`Runtime::start_with_model`].
    pub async fn start(config: &Config) -> Result<Self, StartupError> {
        let model: Arc<dyn ModelClient> = Arc::new(OllamaClient::new(&config.llm));
        Self::start_with_model(config, model).await
    }

    /// Starts the gateway (unless disabled), then the engine.
    ///
    /// Providers that fail to connect do not stop startup.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError`] if a service cannot subscribe to the bus.
    pub async fn start_with_model(
        config: &Config,
        model: Arc<dyn ModelClient>,
    ) -> Result<Self, StartupError> {
        Self::start_on(config, MessageBus::new(), model).await
    }

    /// Starts every service on an existing bus. A started gateway is
    /// stopped again if the engine fails to start.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError`] if a service cannot subscribe to the bus.
    pub async fn start_on(
        config: &Config,
        bus: MessageBus,
        model: Arc<dyn ModelClient>,
    ) -> Result<Self, StartupError> {
        let breakers = Arc::new(BreakerRegistry::new(config.circuit.clone()));

        let gateway = if config.gateway.enabled {
            let gateway = Arc::new(ToolGateway::new(bus.clone(), config.gateway.clone()));
            gateway.start().await?;
            Some(gateway)
        } else {
            tracing::info!("tool gateway disabled");
            None
        };

        let engine = match start_engine(config, &bus, &breakers, model).await {
            Ok(engine) => engine,
            Err(e) => {
                if let Some(gateway) = &gateway {
                    gateway.stop().await;
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            state: AppState {
                bus,
                gateway,
                engine: Some(engine),
                breakers,
            },
        })
    }

    /// State for the HTTP router.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Stops the engine, then the gateway, then the bus.
    pub async fn shutdown(self) {
        tracing::info!("shutting down runtime");
        if let Some(engine) = &self.state.engine {
            engine.stop();
        }
        if let Some(gateway) = &self.state.gateway {
            gateway.stop().await;
        }
        self.state.bus.shutdown();
    }
}
