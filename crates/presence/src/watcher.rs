//! Token watch assembly
//!
//! Builds the full presence subsystem around one driver: lifecycle
//! controller, normalizer, device registry and the per-session pipeline.

use crate::driver::SharedDriver;
use crate::generator::GeneratorConfig;
use crate::lifecycle::{LifecycleConfig, LifecycleController};
use crate::normalizer::PresenceNormalizer;
use crate::pipeline::PresencePipeline;
use crate::registry::DeviceRegistry;
use common::Error;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct TokenWatchConfig {
    pub lifecycle: LifecycleConfig,
    pub generator: GeneratorConfig,
}

/// Running presence subsystem
///
/// Starts finalized; call [`LifecycleController::request_initialize`] (or
/// `on_host_foreground`) on [`TokenWatch::controller`] to bring the driver up.
pub struct TokenWatch {
    driver: SharedDriver,
    controller: Arc<LifecycleController>,
    normalizer: PresenceNormalizer,
    registry: DeviceRegistry,
}

impl TokenWatch {
    /// Assemble the subsystem on the current Tokio runtime
    pub fn start(driver: SharedDriver, config: TokenWatchConfig) -> common::Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Other(format!("TokenWatch needs a Tokio runtime: {}", e)))?;
        Self::start_on(driver, config, runtime)
    }

    /// Assemble the subsystem with session tasks running on `runtime`
    pub fn start_on(
        driver: SharedDriver,
        config: TokenWatchConfig,
        runtime: Handle,
    ) -> common::Result<Self> {
        let controller = LifecycleController::spawn(driver.clone(), config.lifecycle, runtime)?;
        let normalizer = PresenceNormalizer::new();
        let registry = DeviceRegistry::new(normalizer.clone());

        // The registry subscribes in its post-init, so it must come before
        // the pipeline starts producing events
        controller.add_listener(Arc::new(registry.clone()));
        controller.add_listener(Arc::new(PresencePipeline::new(
            normalizer.clone(),
            config.generator,
        )));

        info!("Token watch started");
        Ok(Self {
            driver,
            controller: Arc::new(controller),
            normalizer,
            registry,
        })
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn normalizer(&self) -> &PresenceNormalizer {
        &self.normalizer
    }

    pub fn driver(&self) -> &SharedDriver {
        &self.driver
    }

    /// Finalize the driver and stop the lifecycle worker
    pub async fn shutdown(&self) -> common::Result<()> {
        self.controller.shutdown().await?;
        info!("Token watch stopped");
        Ok(())
    }
}

impl std::fmt::Debug for TokenWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenWatch")
            .field("controller", &self.controller)
            .field("registry", &self.registry)
            .finish()
    }
}
