//! Lazily built ECS clients, one per platform provider

use super::EcsProviderConfig;
use super::client::{EcsApi, EcsClient};
use parking_lot::Mutex;
use pipecd_common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

type Factory = Box<dyn Fn(&EcsProviderConfig) -> Result<Arc<dyn EcsApi>> + Send + Sync>;

/// Concurrent lookups of the same provider share a single client build
pub struct ClientRegistry {
    configs: BTreeMap<String, EcsProviderConfig>,
    clients: Mutex<HashMap<String, Arc<OnceCell<Arc<dyn EcsApi>>>>>,
    factory: Factory,
}

impl ClientRegistry {
    pub fn new(configs: BTreeMap<String, EcsProviderConfig>) -> Self {
        Self::with_factory(configs, |cfg| Ok(Arc::new(EcsClient::from_config(cfg)?) as Arc<dyn EcsApi>))
    }

    pub fn with_factory<F>(configs: BTreeMap<String, EcsProviderConfig>, factory: F) -> Self
    where
        F: Fn(&EcsProviderConfig) -> Result<Arc<dyn EcsApi>> + Send + Sync + 'static,
    {
        Self {
            configs,
            clients: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    pub async fn client(&self, provider: &str) -> Result<Arc<dyn EcsApi>> {
        let cfg = self
            .configs
            .get(provider)
            .ok_or_else(|| Error::not_found(format!("ecs platform provider {provider}")))?;
        let cell = Arc::clone(self.clients.lock().entry(provider.to_string()).or_default());
        let client = cell
            .get_or_try_init(|| async {
                info!(provider, region = %cfg.region, "building ecs client");
                (self.factory)(cfg)
            })
            .await?;
        Ok(Arc::clone(client))
    }
}
