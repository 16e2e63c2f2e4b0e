use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::module::ModuleSelections;
use crate::record::Downsampling;
use crate::worker::mailbox::MailboxConfig;

/// Providers bound when the `modules` section does not name one.
pub const DEFAULT_PROVIDERS: &[(&str, &str)] = &[
    ("telemetry", "prometheus"),
    ("storage", "memory"),
    ("cluster", "standalone"),
    ("core", "default"),
];

/// Top-level configuration for the collector.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Per-stage worker pool configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Trace analysis configuration.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Time bucket rollup configuration.
    #[serde(default)]
    pub downsampling: DownsamplingConfig,

    /// Persistence timer configuration.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Provider selection: module -> provider -> settings.
    #[serde(default)]
    pub modules: ModuleSelections,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address for /metrics and /healthz. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Worker pools, one per pipeline stage.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_analysis_stage")]
    pub analysis: StageConfig,

    #[serde(default = "default_aggregation_stage")]
    pub aggregation: StageConfig,

    #[serde(default)]
    pub remote: StageConfig,

    #[serde(default)]
    pub downsampling: StageConfig,

    #[serde(default)]
    pub persistence: StageConfig,
}

/// Worker pool configuration for one stage.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    /// Workers of this stage allowed to run at once. Default: 2.
    #[serde(default = "default_stage_workers")]
    pub workers: usize,

    /// Messages a worker drains before signalling end-of-batch. Default: 500.
    #[serde(default = "default_stage_batch_size")]
    pub batch_size: usize,

    /// Idle interval after which pending state is flushed. Default: 1s.
    #[serde(default = "default_stage_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Mailbox sizing and full-queue policy.
    #[serde(default)]
    pub mailbox: MailboxConfig,
}

/// Trace analysis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Apdex satisfied threshold. Default: 500ms.
    #[serde(default = "default_apdex_threshold", with = "humantime_serde")]
    pub apdex_threshold: Duration,
}

/// Time bucket rollup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DownsamplingConfig {
    /// Granularities maintained besides the aggregation output.
    #[serde(default = "default_downsampling_levels")]
    pub levels: Vec<DownsamplingLevel>,
}

/// One rollup granularity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DownsamplingLevel {
    pub granularity: Downsampling,

    /// End-of-batch signals between flushes of this level. Default: 1.
    #[serde(default = "default_flush_every")]
    pub flush_every: u32,
}

/// Persistence timer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Time between flush cycles. Default: 3s.
    #[serde(default = "default_persistence_period", with = "humantime_serde")]
    pub period: Duration,

    /// Delay before the first cycle. Default: 5s.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Rows per upsert batch. Default: 2000.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Concurrent batch writers per cycle. Default: 2.
    #[serde(default = "default_sync_workers")]
    pub sync_workers: usize,

    /// Poll interval while waiting for writers to leave a buffer. Default: 1ms.
    #[serde(default = "default_drain_poll", with = "humantime_serde")]
    pub drain_poll: Duration,

    /// Put failed deltas back into the cache for the next cycle. Default: true.
    #[serde(default = "default_true")]
    pub requeue_failed: bool,
}

/// Payload compression for peer RPC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// `Content-Encoding` header value, if any.
    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
            Self::Zstd => Some("zstd"),
        }
    }
}

/// Settings of the `cluster/static` provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSettings {
    /// Address peers use to reach this node; must appear in `peers`.
    #[serde(default = "default_self_address")]
    pub self_address: String,

    /// Listen address for the remote RPC endpoint. Default: ":11800".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Every cluster member, this node included, as "host:port".
    #[serde(default)]
    pub peers: Vec<String>,

    /// Per-request timeout for peer RPC. Default: 5s.
    #[serde(default = "default_remote_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Payload compression for peer RPC. Default: none.
    #[serde(default)]
    pub compression: Compression,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_true() -> bool {
    true
}

fn default_stage_workers() -> usize {
    2
}

fn default_stage_batch_size() -> usize {
    500
}

fn default_stage_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_analysis_stage() -> StageConfig {
    StageConfig {
        batch_size: 100,
        ..Default::default()
    }
}

fn default_aggregation_stage() -> StageConfig {
    StageConfig {
        workers: 4,
        mailbox: MailboxConfig {
            capacity: 2000,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn default_apdex_threshold() -> Duration {
    Duration::from_millis(500)
}

fn default_flush_every() -> u32 {
    1
}

fn default_downsampling_levels() -> Vec<DownsamplingLevel> {
    [Downsampling::Minute, Downsampling::Hour, Downsampling::Day]
        .into_iter()
        .map(|granularity| DownsamplingLevel {
            granularity,
            flush_every: default_flush_every(),
        })
        .collect()
}

fn default_persistence_period() -> Duration {
    Duration::from_secs(3)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_batch_size() -> usize {
    2000
}

fn default_sync_workers() -> usize {
    2
}

fn default_drain_poll() -> Duration {
    Duration::from_millis(1)
}

fn default_self_address() -> String {
    "127.0.0.1:11800".to_string()
}

fn default_listen_addr() -> String {
    ":11800".to_string()
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            health: HealthConfig::default(),
            pipeline: PipelineConfig::default(),
            analysis: AnalysisConfig::default(),
            downsampling: DownsamplingConfig::default(),
            persistence: PersistenceConfig::default(),
            modules: ModuleSelections::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analysis: default_analysis_stage(),
            aggregation: default_aggregation_stage(),
            remote: StageConfig::default(),
            downsampling: StageConfig::default(),
            persistence: StageConfig::default(),
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            workers: default_stage_workers(),
            batch_size: default_stage_batch_size(),
            flush_interval: default_stage_flush_interval(),
            mailbox: MailboxConfig::default(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            apdex_threshold: default_apdex_threshold(),
        }
    }
}

impl Default for DownsamplingConfig {
    fn default() -> Self {
        Self {
            levels: default_downsampling_levels(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            period: default_persistence_period(),
            initial_delay: default_initial_delay(),
            max_batch_size: default_max_batch_size(),
            sync_workers: default_sync_workers(),
            drain_poll: default_drain_poll(),
            requeue_failed: default_true(),
        }
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            self_address: default_self_address(),
            listen_addr: default_listen_addr(),
            peers: Vec::new(),
            timeout: default_remote_timeout(),
            compression: Compression::default(),
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file and validates it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        for (name, stage) in self.pipeline.stages() {
            if stage.workers == 0 {
                bail!("pipeline.{name}.workers must be positive");
            }
            if stage.batch_size == 0 {
                bail!("pipeline.{name}.batch_size must be positive");
            }
            if stage.flush_interval.is_zero() {
                bail!("pipeline.{name}.flush_interval must be positive");
            }
            if stage.mailbox.capacity == 0 {
                bail!("pipeline.{name}.mailbox.capacity must be positive");
            }
        }

        if self.analysis.apdex_threshold.is_zero() {
            bail!("analysis.apdex_threshold must be positive");
        }

        self.downsampling.validate()?;

        let p = &self.persistence;
        if p.period.is_zero() {
            bail!("persistence.period must be positive");
        }
        if p.max_batch_size == 0 {
            bail!("persistence.max_batch_size must be positive");
        }
        if p.sync_workers == 0 {
            bail!("persistence.sync_workers must be positive");
        }
        if p.drain_poll.is_zero() {
            bail!("persistence.drain_poll must be positive");
        }

        for (module, providers) in &self.modules {
            if providers.is_empty() {
                bail!("modules.{module} must name a provider");
            }
        }

        Ok(())
    }

    /// Provider selections with built-in defaults filled in for every
    /// module the file does not mention.
    pub fn module_selections(&self) -> ModuleSelections {
        let mut selections = self.modules.clone();
        for (module, provider) in DEFAULT_PROVIDERS {
            selections
                .entry((*module).to_string())
                .or_insert_with(|| {
                    [((*provider).to_string(), serde_yaml::Value::Null)]
                        .into_iter()
                        .collect()
                });
        }
        selections
    }
}

impl PipelineConfig {
    pub fn stages(&self) -> [(&'static str, &StageConfig); 5] {
        [
            ("analysis", &self.analysis),
            ("aggregation", &self.aggregation),
            ("remote", &self.remote),
            ("downsampling", &self.downsampling),
            ("persistence", &self.persistence),
        ]
    }
}

impl DownsamplingConfig {
    /// Validates the level list. Minute is mandatory since every other
    /// level is rolled up from it.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for level in &self.levels {
            if !seen.insert(level.granularity) {
                bail!(
                    "downsampling.levels lists {} more than once",
                    level.granularity
                );
            }
            if level.flush_every == 0 {
                bail!(
                    "downsampling.levels.{}.flush_every must be positive",
                    level.granularity
                );
            }
        }

        if !seen.contains(&Downsampling::Minute) {
            bail!("downsampling.levels must include minute");
        }

        Ok(())
    }
}

/// Materializes a provider settings section. An absent section yields the
/// type's defaults.
pub fn provider_settings<T: DeserializeOwned + Default>(settings: &serde_yaml::Value) -> Result<T> {
    if settings.is_null() {
        return Ok(T::default());
    }

    serde_yaml::from_value(settings.clone()).context("parsing provider settings")
}
