pub mod error;
pub mod sequence;
pub mod service;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error, info};

pub use error::ModuleError;
pub use service::{ServiceKey, ServiceRegistry};

use sequence::Dependency;

/// Provider selection and settings: module name -> provider name -> settings.
pub type ModuleSelections = BTreeMap<String, BTreeMap<String, serde_yaml::Value>>;

/// A named capability boundary and the services its provider must register.
#[derive(Debug, Clone)]
pub struct ModuleDefine {
    pub name: &'static str,
    pub services: Vec<&'static str>,
}

impl ModuleDefine {
    pub fn new(name: &'static str, services: &[&'static str]) -> Self {
        Self {
            name,
            services: services.to_vec(),
        }
    }
}

/// One implementation of a module.
///
/// Lifecycle: discovered -> configured -> prepared -> started -> notified.
/// Services must be registered in `prepare`; `start` and
/// `notify_after_completed` only resolve them.
#[async_trait]
pub trait ModuleProvider: Send {
    /// Provider name, unique within its module (e.g. "memory").
    fn name(&self) -> &'static str;

    /// Module this provider implements.
    fn module(&self) -> &'static str;

    /// Modules whose providers must be prepared and started first.
    fn required_modules(&self) -> &'static [&'static str] {
        &[]
    }

    /// Materializes the provider's settings section.
    fn configure(&mut self, _settings: &serde_yaml::Value) -> Result<()> {
        Ok(())
    }

    async fn prepare(&mut self, services: &mut ServiceRegistry) -> Result<()>;

    async fn start(&mut self, services: &ServiceRegistry) -> Result<()>;

    /// Runs once every provider in the sequence has started.
    async fn notify_after_completed(&mut self, _services: &ServiceRegistry) -> Result<()> {
        Ok(())
    }

    /// Tears the provider down at process shutdown.
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Lifecycle state of a bound provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProviderState {
    Discovered,
    Configured,
    Prepared,
    Started,
    Notified,
}

struct BoundProvider {
    define: ModuleDefine,
    provider: Box<dyn ModuleProvider>,
    state: ProviderState,
}

impl BoundProvider {
    fn label(&self) -> String {
        format!("{}/{}", self.define.name, self.provider.name())
    }
}

/// Wall time spent in each bootstrap pass.
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    pub sequence: Vec<String>,
    pub prepare: Duration,
    pub start: Duration,
    pub notify: Duration,
}

/// Binds every declared module to exactly one provider and drives them
/// through the bootstrap passes in dependency order.
pub struct ModuleManager {
    bound: Vec<BoundProvider>,
    services: ServiceRegistry,
}

impl ModuleManager {
    /// Selects, configures and sequences providers. Nothing is prepared yet.
    pub fn new(
        defines: Vec<ModuleDefine>,
        candidates: Vec<Box<dyn ModuleProvider>>,
        selections: &ModuleSelections,
    ) -> Result<Self> {
        let mut by_module: HashMap<&'static str, Vec<Box<dyn ModuleProvider>>> = HashMap::new();
        for candidate in candidates {
            by_module
                .entry(candidate.module())
                .or_default()
                .push(candidate);
        }

        let mut bound = Vec::with_capacity(defines.len());
        for define in defines {
            let selection = selections.get(define.name);
            let mut eligible: Vec<Box<dyn ModuleProvider>> = by_module
                .remove(define.name)
                .unwrap_or_default()
                .into_iter()
                .filter(|p| selection.map_or(true, |s| s.contains_key(p.name())))
                .collect();

            if eligible.len() > 1 {
                return Err(ModuleError::DuplicateProvider {
                    module: define.name.to_string(),
                    providers: eligible.iter().map(|p| p.name().to_string()).collect(),
                }
                .into());
            }
            let Some(mut provider) = eligible.pop() else {
                return Err(ModuleError::NoProvider {
                    module: define.name.to_string(),
                }
                .into());
            };

            let settings = selection
                .and_then(|s| s.get(provider.name()))
                .cloned()
                .unwrap_or(serde_yaml::Value::Null);
            provider
                .configure(&settings)
                .with_context(|| format!("configuring {}/{}", define.name, provider.name()))?;

            bound.push(BoundProvider {
                define,
                provider,
                state: ProviderState::Configured,
            });
        }

        for (module, orphans) in &by_module {
            debug!(
                module = %module,
                providers = orphans.len(),
                "ignoring providers for undeclared module",
            );
        }

        let order = {
            let deps: Vec<Dependency<'_>> = bound
                .iter()
                .map(|b| Dependency {
                    module: b.define.name,
                    provider: b.provider.name(),
                    required: b.provider.required_modules(),
                })
                .collect();
            sequence::sequence(&deps)?
        };

        let mut slots: Vec<Option<BoundProvider>> = bound.into_iter().map(Some).collect();
        let bound = order
            .into_iter()
            .filter_map(|idx| slots.get_mut(idx).and_then(Option::take))
            .collect();

        Ok(Self {
            bound,
            services: ServiceRegistry::new(),
        })
    }

    /// Runs prepare, start and notify as three full passes over the sequence.
    pub async fn boot(&mut self) -> Result<BootstrapReport> {
        let mut report = BootstrapReport {
            sequence: self.sequence(),
            ..Default::default()
        };
        info!(sequence = ?report.sequence, "module bootstrap sequence computed");

        let phase_start = Instant::now();
        for bound in &mut self.bound {
            let label = bound.label();
            bound
                .provider
                .prepare(&mut self.services)
                .await
                .with_context(|| format!("preparing {label}"))?;

            let missing: Vec<String> = bound
                .define
                .services
                .iter()
                .filter(|s| !self.services.contains(s))
                .map(|s| s.to_string())
                .collect();
            if !missing.is_empty() {
                return Err(ModuleError::ServiceMissing {
                    module: bound.define.name.to_string(),
                    services: missing,
                }
                .into());
            }
            bound.state = ProviderState::Prepared;
        }
        report.prepare = phase_start.elapsed();

        let phase_start = Instant::now();
        for bound in &mut self.bound {
            let label = bound.label();
            bound
                .provider
                .start(&self.services)
                .await
                .with_context(|| format!("starting {label}"))?;
            bound.state = ProviderState::Started;
        }
        report.start = phase_start.elapsed();

        let phase_start = Instant::now();
        for bound in &mut self.bound {
            let label = bound.label();
            bound
                .provider
                .notify_after_completed(&self.services)
                .await
                .with_context(|| format!("notifying {label}"))?;
            bound.state = ProviderState::Notified;
        }
        report.notify = phase_start.elapsed();

        info!(
            providers = self.bound.len(),
            prepare_ms = report.prepare.as_millis() as u64,
            start_ms = report.start.as_millis() as u64,
            notify_ms = report.notify.as_millis() as u64,
            "module bootstrap completed",
        );

        Ok(report)
    }

    /// Shuts started providers down in reverse sequence order.
    pub async fn shutdown(&mut self) {
        for bound in self.bound.iter_mut().rev() {
            if bound.state < ProviderState::Started {
                continue;
            }
            let label = bound.label();
            if let Err(e) = bound.provider.shutdown().await {
                error!(provider = %label, error = %e, "provider shutdown failed");
            }
        }
    }

    /// Bound providers as "module/provider" in startup order.
    pub fn sequence(&self) -> Vec<String> {
        self.bound.iter().map(BoundProvider::label).collect()
    }

    pub fn state(&self, module: &str) -> Option<ProviderState> {
        self.bound
            .iter()
            .find(|b| b.define.name == module)
            .map(|b| b.state)
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }
}
