pub mod providers;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::analysis::StreamGraphs;
use crate::config::Config;
use crate::module::{BootstrapReport, ModuleManager, ModuleProvider, ServiceRegistry};

use self::providers::{builtin_providers, module_defines, HEALTH_SERVICE, STREAMS_SERVICE};

/// Agent owns one collector node: it binds the configured providers and
/// drives them through bootstrap and shutdown.
pub struct Agent {
    manager: ModuleManager,
    streams: Option<Arc<StreamGraphs>>,
}

impl Agent {
    /// Creates an agent from the built-in providers.
    pub fn new(cfg: Config) -> Result<Self> {
        let candidates = builtin_providers(&cfg);
        Self::with_providers(&cfg, candidates)
    }

    /// Creates an agent choosing among `candidates`.
    pub fn with_providers(cfg: &Config, candidates: Vec<Box<dyn ModuleProvider>>) -> Result<Self> {
        let manager = ModuleManager::new(module_defines(), candidates, &cfg.module_selections())
            .context("binding module providers")?;

        Ok(Self {
            manager,
            streams: None,
        })
    }

    /// Boots every provider. A failed bootstrap shuts down whatever already
    /// started before returning the error.
    pub async fn start(&mut self) -> Result<BootstrapReport> {
        let report = match self.manager.boot().await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %format!("{e:#}"), "bootstrap failed");
                self.manager.shutdown().await;
                return Err(e);
            }
        };

        let services = self.manager.services();
        let health = services.get(&HEALTH_SERVICE)?;
        for (phase, duration) in [
            ("prepare", report.prepare),
            ("start", report.start),
            ("notify", report.notify),
        ] {
            health
                .bootstrap_phase_duration
                .with_label_values(&[phase])
                .set(duration.as_secs_f64());
        }

        self.streams = Some(services.get(&STREAMS_SERVICE)?);
        info!(sequence = ?report.sequence, "collector started");

        Ok(report)
    }

    /// Ingest entry points. Available once started.
    pub fn streams(&self) -> Result<Arc<StreamGraphs>> {
        self.streams.clone().context("agent is not started")
    }

    pub fn services(&self) -> &ServiceRegistry {
        self.manager.services()
    }

    /// Bound providers as "module/provider" in startup order.
    pub fn sequence(&self) -> Vec<String> {
        self.manager.sequence()
    }

    /// Shuts providers down in reverse startup order. Pending metrics are
    /// flushed to storage before storage itself goes away.
    pub async fn stop(&mut self) -> Result<()> {
        self.streams = None;
        self.manager.shutdown().await;
        info!("collector stopped");
        Ok(())
    }
}
