//! Built-in module providers.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::analysis::StreamGraphs;
use crate::config::{provider_settings, ClusterSettings, Config};
use crate::export::health::HealthMetrics;
use crate::graph::GraphManager;
use crate::module::{ModuleDefine, ModuleProvider, ServiceKey, ServiceRegistry};
use crate::persistence::PersistenceTimer;
use crate::remote::{
    ClusterContext, ClusterMembership, HttpTransport, LoopbackTransport, RemoteServer,
    RemoteTransport, StaticMembership,
};
use crate::storage::{MemoryStorage, Storage};

pub const TELEMETRY: &str = "telemetry";
pub const STORAGE: &str = "storage";
pub const CLUSTER: &str = "cluster";
pub const CORE: &str = "core";

pub const HEALTH_SERVICE: ServiceKey<Arc<HealthMetrics>> = ServiceKey::new("telemetry.health");
pub const STORAGE_SERVICE: ServiceKey<Arc<dyn Storage>> = ServiceKey::new("storage.client");
pub const MEMBERSHIP_SERVICE: ServiceKey<Arc<dyn ClusterMembership>> =
    ServiceKey::new("cluster.membership");
pub const TRANSPORT_SERVICE: ServiceKey<Arc<dyn RemoteTransport>> =
    ServiceKey::new("cluster.transport");
pub const GRAPHS_SERVICE: ServiceKey<Arc<GraphManager>> = ServiceKey::new("core.graphs");
pub const STREAMS_SERVICE: ServiceKey<Arc<StreamGraphs>> = ServiceKey::new("core.streams");
pub const TIMER_SERVICE: ServiceKey<Arc<PersistenceTimer>> =
    ServiceKey::new("core.persistence_timer");

/// Modules of a collector node and the services each must provide.
pub fn module_defines() -> Vec<ModuleDefine> {
    vec![
        ModuleDefine::new(TELEMETRY, &[HEALTH_SERVICE.name()]),
        ModuleDefine::new(STORAGE, &[STORAGE_SERVICE.name()]),
        ModuleDefine::new(CLUSTER, &[MEMBERSHIP_SERVICE.name(), TRANSPORT_SERVICE.name()]),
        ModuleDefine::new(
            CORE,
            &[GRAPHS_SERVICE.name(), STREAMS_SERVICE.name(), TIMER_SERVICE.name()],
        ),
    ]
}

/// Every built-in provider; module selections pick one per module.
pub fn builtin_providers(cfg: &Config) -> Vec<Box<dyn ModuleProvider>> {
    vec![
        Box::new(PrometheusTelemetry::new(&cfg.health.addr, true)),
        Box::new(PrometheusTelemetry::new(&cfg.health.addr, false)),
        Box::new(MemoryStorageProvider::default()),
        Box::new(StandaloneCluster),
        Box::new(StaticCluster::default()),
        Box::new(CoreProvider::new(cfg.clone())),
    ]
}

#[derive(Debug, Default, Deserialize)]
struct TelemetrySettings {
    /// Overrides `health.addr`.
    #[serde(default)]
    addr: Option<String>,
}

/// Health metrics. The "prometheus" variant serves them over HTTP; "none"
/// only keeps them in process.
pub struct PrometheusTelemetry {
    addr: String,
    serve: bool,
    health: Option<Arc<HealthMetrics>>,
}

impl PrometheusTelemetry {
    pub fn new(addr: &str, serve: bool) -> Self {
        Self {
            addr: addr.to_string(),
            serve,
            health: None,
        }
    }
}

#[async_trait]
impl ModuleProvider for PrometheusTelemetry {
    fn name(&self) -> &'static str {
        if self.serve {
            "prometheus"
        } else {
            "none"
        }
    }

    fn module(&self) -> &'static str {
        TELEMETRY
    }

    fn configure(&mut self, settings: &serde_yaml::Value) -> Result<()> {
        let settings: TelemetrySettings = provider_settings(settings)?;
        if let Some(addr) = settings.addr {
            self.addr = addr;
        }
        Ok(())
    }

    async fn prepare(&mut self, services: &mut ServiceRegistry) -> Result<()> {
        let health = Arc::new(HealthMetrics::new(&self.addr).context("creating health metrics")?);
        services.register(&HEALTH_SERVICE, Arc::clone(&health));
        self.health = Some(health);
        Ok(())
    }

    async fn start(&mut self, _services: &ServiceRegistry) -> Result<()> {
        if !self.serve {
            return Ok(());
        }
        if let Some(health) = &self.health {
            health
                .start()
                .await
                .context("starting health metrics server")?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(health) = &self.health {
            health.stop().await?;
        }
        Ok(())
    }
}

/// Rows kept in process memory.
#[derive(Default)]
pub struct MemoryStorageProvider;

#[async_trait]
impl ModuleProvider for MemoryStorageProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn module(&self) -> &'static str {
        STORAGE
    }

    async fn prepare(&mut self, services: &mut ServiceRegistry) -> Result<()> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        services.register(&STORAGE_SERVICE, storage);
        Ok(())
    }

    async fn start(&mut self, _services: &ServiceRegistry) -> Result<()> {
        Ok(())
    }
}

/// Single-node cluster: every record is owned locally.
pub struct StandaloneCluster;

#[async_trait]
impl ModuleProvider for StandaloneCluster {
    fn name(&self) -> &'static str {
        "standalone"
    }

    fn module(&self) -> &'static str {
        CLUSTER
    }

    async fn prepare(&mut self, services: &mut ServiceRegistry) -> Result<()> {
        let membership: Arc<dyn ClusterMembership> = Arc::new(StaticMembership::standalone());
        let transport: Arc<dyn RemoteTransport> = Arc::new(LoopbackTransport::new());
        services.register(&MEMBERSHIP_SERVICE, membership);
        services.register(&TRANSPORT_SERVICE, transport);
        Ok(())
    }

    async fn start(&mut self, _services: &ServiceRegistry) -> Result<()> {
        Ok(())
    }
}

/// Fixed peer list with HTTP transport. The RPC endpoint opens once the
/// whole node has started, so peers never reach a half-built graph.
#[derive(Default)]
pub struct StaticCluster {
    settings: ClusterSettings,
    server: Option<RemoteServer>,
}

#[async_trait]
impl ModuleProvider for StaticCluster {
    fn name(&self) -> &'static str {
        "static"
    }

    fn module(&self) -> &'static str {
        CLUSTER
    }

    fn required_modules(&self) -> &'static [&'static str] {
        &[TELEMETRY]
    }

    fn configure(&mut self, settings: &serde_yaml::Value) -> Result<()> {
        self.settings = provider_settings(settings).context("parsing modules.cluster.static")?;
        Ok(())
    }

    async fn prepare(&mut self, services: &mut ServiceRegistry) -> Result<()> {
        let membership: Arc<dyn ClusterMembership> = Arc::new(StaticMembership::from_addresses(
            &self.settings.self_address,
            &self.settings.peers,
        )?);
        let transport: Arc<dyn RemoteTransport> = Arc::new(HttpTransport::new(&self.settings)?);
        services.register(&MEMBERSHIP_SERVICE, membership);
        services.register(&TRANSPORT_SERVICE, transport);
        Ok(())
    }

    async fn start(&mut self, services: &ServiceRegistry) -> Result<()> {
        let peers = services.get(&MEMBERSHIP_SERVICE)?.current_peers();
        services.get(&HEALTH_SERVICE)?.cluster_size.set(peers.len() as f64);
        info!(
            peers = ?peers.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "static cluster membership loaded",
        );
        Ok(())
    }

    async fn notify_after_completed(&mut self, services: &ServiceRegistry) -> Result<()> {
        let server = RemoteServer::new(
            &self.settings.listen_addr,
            services.get(&GRAPHS_SERVICE)?,
            Some(services.get(&HEALTH_SERVICE)?),
        );
        server.start().await.context("starting remote server")?;
        self.server = Some(server);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(server) = self.server.take() {
            server.stop().await;
        }
        Ok(())
    }
}

/// The analysis graphs and the persistence timer flushing them.
pub struct CoreProvider {
    cfg: Config,
    streams: Option<Arc<StreamGraphs>>,
    timer: Option<Arc<PersistenceTimer>>,
}

impl CoreProvider {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            streams: None,
            timer: None,
        }
    }
}

#[async_trait]
impl ModuleProvider for CoreProvider {
    fn name(&self) -> &'static str {
        "default"
    }

    fn module(&self) -> &'static str {
        CORE
    }

    fn required_modules(&self) -> &'static [&'static str] {
        &[TELEMETRY, STORAGE, CLUSTER]
    }

    async fn prepare(&mut self, services: &mut ServiceRegistry) -> Result<()> {
        let health = services.get(&HEALTH_SERVICE)?;
        let cluster = ClusterContext {
            membership: services.get(&MEMBERSHIP_SERVICE)?,
            transport: services.get(&TRANSPORT_SERVICE)?,
        };

        let graphs = Arc::new(GraphManager::new());
        let timer = Arc::new(PersistenceTimer::new(
            self.cfg.persistence.clone(),
            services.get(&STORAGE_SERVICE)?,
            Some(Arc::clone(&health)),
        ));
        let streams = Arc::new(
            StreamGraphs::build(&self.cfg, &graphs, &cluster, &timer, Some(health))
                .context("building analysis graphs")?,
        );

        services.register(&GRAPHS_SERVICE, graphs);
        services.register(&STREAMS_SERVICE, Arc::clone(&streams));
        services.register(&TIMER_SERVICE, Arc::clone(&timer));
        self.streams = Some(streams);
        self.timer = Some(timer);
        Ok(())
    }

    async fn start(&mut self, _services: &ServiceRegistry) -> Result<()> {
        if let Some(timer) = &self.timer {
            timer.start();
        }
        Ok(())
    }

    /// Drains every stage into the caches, then flushes them one last time.
    async fn shutdown(&mut self) -> Result<()> {
        if let Some(streams) = &self.streams {
            streams.shutdown().await;
        }
        if let Some(timer) = &self.timer {
            timer.stop().await;
        }
        Ok(())
    }
}
