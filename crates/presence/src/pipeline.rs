//! Per-session event pipeline
//!
//! Wires the generator thread to the normalizer for every driver session:
//! the generator pushes raw slot events onto a fresh unbounded queue and the
//! normalizer consumes it on a runtime task. Both stop with the session.

use crate::generator::{EventGenerator, GeneratorConfig};
use crate::lifecycle::LifecycleListener;
use crate::normalizer::PresenceNormalizer;
use crate::session::DriverSession;
use common::unbounded_queue;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PresencePipeline {
    normalizer: PresenceNormalizer,
    config: GeneratorConfig,
}

impl PresencePipeline {
    pub fn new(normalizer: PresenceNormalizer, config: GeneratorConfig) -> Self {
        Self { normalizer, config }
    }
}

impl LifecycleListener for PresencePipeline {
    fn post_init(&self, session: &DriverSession) -> common::Result<()> {
        let (tx, rx) = unbounded_queue();

        let normalizer = self.normalizer.clone();
        let cancel = session.cancellation();
        session.spawn("presence-normalizer", async move {
            normalizer.run(rx, cancel).await;
        });

        EventGenerator::new(session.driver().clone(), tx, self.config.clone()).spawn(session)?;
        debug!("Event pipeline running for session {}", session.generation());
        Ok(())
    }

    fn pre_finalize(&self, session: &DriverSession) -> common::Result<()> {
        // Session cancellation stops both ends
        debug!("Event pipeline stopping for session {}", session.generation());
        Ok(())
    }

    fn name(&self) -> &str {
        "presence-pipeline"
    }
}
