use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use collectoor::agent::providers::{builtin_providers, STORAGE_SERVICE};
use collectoor::agent::Agent;
use collectoor::analysis::model::InstanceSample;
use collectoor::config::Config;
use collectoor::module::{ModuleError, ModuleProvider, ServiceRegistry};
use collectoor::record::{ColumnValue, Downsampling};
use collectoor::storage::{MemoryStorage, Storage, UpsertRequest};
use parking_lot::Mutex;

const T0: i64 = 1_717_000_000_000;

fn config(yaml: &str) -> Config {
    let mut cfg: Config = serde_yaml::from_str(yaml).expect("config");
    cfg.persistence.initial_delay = Duration::from_secs(60);
    cfg.validate().expect("valid");
    cfg
}

/// Storage remembering every batch it was asked to write.
#[derive(Default)]
struct RecordingStorage {
    inner: MemoryStorage,
    batches: Mutex<Vec<Vec<UpsertRequest>>>,
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn read_existing(&self, model: &str, id: &str) -> Result<Option<collectoor::record::Row>> {
        self.inner.read_existing(model, id).await
    }

    async fn batch_upsert(&self, requests: Vec<UpsertRequest>) -> Result<()> {
        self.batches.lock().push(requests.clone());
        self.inner.batch_upsert(requests).await
    }
}

struct RecordingProvider {
    storage: Arc<RecordingStorage>,
    register: bool,
}

#[async_trait]
impl ModuleProvider for RecordingProvider {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn module(&self) -> &'static str {
        "storage"
    }

    async fn prepare(&mut self, services: &mut ServiceRegistry) -> Result<()> {
        if self.register {
            let storage: Arc<dyn Storage> = self.storage.clone();
            services.register(&STORAGE_SERVICE, storage);
        }
        Ok(())
    }

    async fn start(&mut self, _services: &ServiceRegistry) -> Result<()> {
        Ok(())
    }
}

/// Telemetry provider that wrongly depends on the core module.
struct LoopedTelemetry;

#[async_trait]
impl ModuleProvider for LoopedTelemetry {
    fn name(&self) -> &'static str {
        "looped"
    }

    fn module(&self) -> &'static str {
        "telemetry"
    }

    fn required_modules(&self) -> &'static [&'static str] {
        &["core"]
    }

    async fn prepare(&mut self, _services: &mut ServiceRegistry) -> Result<()> {
        Ok(())
    }

    async fn start(&mut self, _services: &ServiceRegistry) -> Result<()> {
        Ok(())
    }
}

fn with_extra(cfg: &Config, extra: Box<dyn ModuleProvider>) -> Vec<Box<dyn ModuleProvider>> {
    let mut candidates = builtin_providers(cfg);
    candidates.push(extra);
    candidates
}

#[tokio::test]
async fn test_selected_storage_provider_receives_flushes() {
    let cfg = config(
        "modules:\n  telemetry:\n    none: ~\n  storage:\n    recording: ~\npersistence:\n  max_batch_size: 2\n",
    );
    let storage = Arc::new(RecordingStorage::default());
    let provider = RecordingProvider {
        storage: Arc::clone(&storage),
        register: true,
    };

    let mut agent = Agent::with_providers(&cfg, with_extra(&cfg, Box::new(provider))).unwrap();
    assert!(agent.sequence().contains(&"storage/recording".to_string()));
    agent.start().await.unwrap();

    let streams = agent.streams().unwrap();
    for (instance, cpu) in [("a", 10.0), ("a", 30.0), ("b", 50.0)] {
        streams
            .ingest_instance_sample(InstanceSample {
                service: "cart".to_string(),
                instance: instance.to_string(),
                timestamp: T0,
                cpu_percent: cpu,
                heap_used: 512,
                gc_count: 1,
                agent_version: "9.1".to_string(),
            })
            .await
            .unwrap();
    }
    drop(streams);
    agent.stop().await.unwrap();

    let batches = storage.batches.lock();
    assert!(!batches.is_empty());
    assert!(batches.iter().all(|batch| batch.len() <= 2));

    let bucket = Downsampling::Minute.bucket(T0).unwrap();
    let row = storage
        .inner
        .get("instance_metric_minute", &format!("{bucket}_a@cart"))
        .expect("instance a persisted");
    assert_eq!(row["samples"], ColumnValue::Long(2));
    assert_eq!(row["cpu_avg"], ColumnValue::Double(20.0));
}

#[tokio::test]
async fn test_missing_service_aborts_bootstrap() {
    let cfg = config("modules:\n  telemetry:\n    none: ~\n  storage:\n    recording: ~\n");
    let provider = RecordingProvider {
        storage: Arc::new(RecordingStorage::default()),
        register: false,
    };

    let mut agent = Agent::with_providers(&cfg, with_extra(&cfg, Box::new(provider))).unwrap();
    let err = agent.start().await.expect_err("storage.client never registered");
    assert_eq!(
        err.downcast_ref::<ModuleError>(),
        Some(&ModuleError::ServiceMissing {
            module: "storage".to_string(),
            services: vec!["storage.client".to_string()],
        })
    );
}

#[tokio::test]
async fn test_cycle_is_rejected_before_boot() {
    let cfg = config("modules:\n  telemetry:\n    looped: ~\n");
    let err = Agent::with_providers(&cfg, with_extra(&cfg, Box::new(LoopedTelemetry)))
        .err()
        .expect("cycle");

    match err.downcast_ref::<ModuleError>() {
        Some(ModuleError::CycleDependency { providers }) => {
            assert!(providers.contains(&"telemetry/looped".to_string()));
            assert!(providers.contains(&"core/default".to_string()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_provider_names_are_rejected() {
    let cfg = config("modules:\n  telemetry:\n    none: ~\n");
    let mut candidates = builtin_providers(&cfg);
    candidates.extend(builtin_providers(&cfg).into_iter().filter(|p| p.module() == "storage"));

    let err = Agent::with_providers(&cfg, candidates).err().expect("duplicate");
    assert!(matches!(
        err.downcast_ref::<ModuleError>(),
        Some(ModuleError::DuplicateProvider { module, .. }) if module == "storage"
    ));
}

#[tokio::test]
async fn test_static_cluster_serves_remote_endpoint() {
    let cfg = config(
        "modules:\n  telemetry:\n    none: ~\n  cluster:\n    static:\n      self_address: \"127.0.0.1:1\"\n      listen_addr: \"127.0.0.1:0\"\n      peers: [\"127.0.0.1:1\"]\n      compression: gzip\n",
    );

    let mut agent = Agent::new(cfg).unwrap();
    let report = agent.start().await.unwrap();
    assert_eq!(
        report.sequence,
        vec![
            "telemetry/none".to_string(),
            "storage/memory".to_string(),
            "cluster/static".to_string(),
            "core/default".to_string(),
        ]
    );
    agent.stop().await.unwrap();
}
