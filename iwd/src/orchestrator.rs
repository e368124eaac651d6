use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use iw_registry::{Service, ServiceContext, ServiceError, ServiceHandle, State};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{ApplicationConfig, ModuleConfig};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Unknown component {0}")]
    UnknownComponent(String),
    #[error("Module {0} failed: {1}")]
    Service(String, #[source] ServiceError),
}

impl From<OrchestratorError> for ServiceError {
    fn from(e: OrchestratorError) -> Self {
        ServiceError::Other(e.to_string())
    }
}

/// Turns a module's component type into a running service handle. Returns
/// `None` for types it does not know
pub trait ComponentFactory: Send + Sync {
    fn create(&self, component: &str, name: Option<&str>) -> Option<Arc<dyn Service>>;
}

#[derive(Clone)]
struct Module {
    config: ModuleConfig,
    service: Arc<dyn Service>,
}

impl Module {
    /// Start the module, then wait for its `await` event if one is set. The
    /// waiter is registered before `start` so an early emit is kept
    async fn start(self) -> Result<(), OrchestratorError> {
        let label = self.config.label();
        let ready = self
            .config
            .await_event
            .as_deref()
            .map(|event| (event.to_string(), self.service.wait_for(event)));

        self.service
            .start(self.config.config.clone())
            .await
            .map_err(|e| OrchestratorError::Service(label.clone(), e))?;

        if let Some((event, ready)) = ready {
            log::info!("Waiting for {label} to emit {event}");
            ready
                .await
                .map_err(|e| OrchestratorError::Service(label.clone(), e))?;
        }
        log::debug!("Module {label} started");
        Ok(())
    }

    fn matches(&self, name: &str) -> bool {
        match &self.config.name {
            Some(own) => own == name,
            None => self.config.component == name,
        }
    }
}

/// Loads the configured modules and starts them tier by tier, lowest
/// priority first. All modules in a tier start concurrently
#[derive(Clone)]
pub struct Orchestrator {
    service: ServiceHandle,
    factory: Arc<dyn ComponentFactory>,
    modules: Arc<Mutex<Vec<Module>>>,
}

impl Orchestrator {
    pub const SERVICE_TYPE: &'static str = "orchestrator";

    pub fn new(context: &ServiceContext, factory: Arc<dyn ComponentFactory>) -> Self {
        Self {
            service: context.register(Self::SERVICE_TYPE, State::Inactive, None),
            factory,
            modules: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn fail(&self, e: &OrchestratorError) {
        log::error!("{e:}");
        self.service.set_error_diagnostic(&e.to_string());
        self.service.set_state(State::Fatal, "failed to start services");
    }

    pub async fn load(&self, modules: Vec<ModuleConfig>) -> Result<(), OrchestratorError> {
        self.service.set_state(State::Busy, "starting services ...");

        let mut loaded = Vec::with_capacity(modules.len());
        for config in modules {
            let Some(service) = self
                .factory
                .create(&config.component, config.name.as_deref())
            else {
                let e = OrchestratorError::UnknownComponent(config.label());
                self.fail(&e);
                return Err(e);
            };
            loaded.push(Module { config, service });
        }

        let mut tiers: BTreeMap<i64, Vec<Module>> = BTreeMap::new();
        {
            let mut modules = self.modules.lock().await;
            for module in loaded {
                tiers
                    .entry(module.config.priority)
                    .or_default()
                    .push(module.clone());
                modules.push(module);
            }
        }

        for (priority, tier) in tiers {
            log::info!("Starting {} module(s) at priority {priority}", tier.len());
            if let Err(e) = try_join_all(tier.into_iter().map(Module::start)).await {
                self.fail(&e);
                return Err(e);
            }
        }

        self.service
            .set_state(State::Ready, "all services started successfully.");
        Ok(())
    }

    /// Stop every loaded module concurrently and forget them
    pub async fn shutdown(&self) {
        self.service.set_state(State::Busy, "stopping services ...");

        let modules = std::mem::take(&mut *self.modules.lock().await);
        let stops = modules.iter().map(|m| async move {
            if let Err(e) = m.service.stop().await {
                log::error!("Error stopping {}: {e:}", m.config.label());
            }
        });
        join_all(stops).await;

        self.service
            .set_state(State::Inactive, "all services stopped successfully.");
    }

    pub async fn module_count(&self) -> usize {
        self.modules.lock().await.len()
    }

    /// `config` maps module names (or component types for unnamed modules)
    /// to their new config. True only if every named module accepted
    pub async fn reconfigure_modules(&self, config: Value) -> Result<bool, ServiceError> {
        let Value::Object(updates) = config else {
            return Ok(false);
        };

        let modules = self.modules.lock().await.clone();
        let mut accepted = true;
        for (name, update) in updates {
            match modules.iter().find(|m| m.matches(&name)) {
                Some(module) => {
                    if !module.service.reconfigure(update).await? {
                        log::info!("Module {name} kept its configuration");
                        accepted = false;
                    }
                }
                None => {
                    log::warn!("No module named {name} to reconfigure");
                    accepted = false;
                }
            }
        }
        Ok(accepted)
    }
}

#[async_trait]
impl Service for Orchestrator {
    fn service_type(&self) -> &'static str {
        Self::SERVICE_TYPE
    }

    async fn start(&self, config: Value) -> Result<(), ServiceError> {
        let config: ApplicationConfig = serde_json::from_value(config)?;
        Ok(self.load(config.modules).await?)
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.shutdown().await;
        Ok(())
    }

    async fn reconfigure(&self, config: Value) -> Result<bool, ServiceError> {
        self.reconfigure_modules(config).await
    }
}
