//! Area to provider resolution.
//!
//! Providers are built lazily, one per area, and cached for the lifetime of
//! the registry so that their session data (flavors, networks) accumulates
//! across blueprints and can be released by [`ProviderRegistry::final_cleanup_all`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use lcm_id::AreaId;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{ProviderError, VirtualizationProvider};

/// Static description of one area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaConfig {
    pub area: AreaId,

    /// Backend endpoint for the area.
    pub endpoint: String,

    /// Attach a floating address to every VM in the area.
    #[serde(default)]
    pub use_floating_ip: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl AreaConfig {
    pub fn new(area: AreaId, endpoint: impl Into<String>) -> Self {
        Self {
            area,
            endpoint: endpoint.into(),
            use_floating_ip: false,
            region: None,
        }
    }

    pub fn with_floating_ip(mut self, enabled: bool) -> Self {
        self.use_floating_ip = enabled;
        self
    }
}

/// Maps an area to its configuration.
pub trait AreaResolver: Send + Sync {
    fn resolve(&self, area: AreaId) -> Result<AreaConfig, ProviderError>;
}

/// Resolver over a fixed set of areas.
#[derive(Debug, Clone, Default)]
pub struct StaticAreas {
    areas: BTreeMap<AreaId, AreaConfig>,
}

impl StaticAreas {
    pub fn new(areas: impl IntoIterator<Item = AreaConfig>) -> Self {
        Self {
            areas: areas.into_iter().map(|a| (a.area, a)).collect(),
        }
    }
}

impl AreaResolver for StaticAreas {
    fn resolve(&self, area: AreaId) -> Result<AreaConfig, ProviderError> {
        self.areas
            .get(&area)
            .cloned()
            .ok_or(ProviderError::UnknownArea(area))
    }
}

/// Builds the provider of one area.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn build(&self, area: &AreaConfig)
        -> Result<Arc<dyn VirtualizationProvider>, ProviderError>;
}

/// Cache of providers, keyed by area.
pub struct ProviderRegistry {
    resolver: Arc<dyn AreaResolver>,
    factory: Arc<dyn ProviderFactory>,
    providers: Mutex<HashMap<AreaId, Arc<dyn VirtualizationProvider>>>,
}

impl ProviderRegistry {
    pub fn new(resolver: Arc<dyn AreaResolver>, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            resolver,
            factory,
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// The provider of `area`, built on first use.
    pub async fn get(&self, area: AreaId) -> Result<Arc<dyn VirtualizationProvider>, ProviderError> {
        let mut providers = self.providers.lock().await;
        if let Some(provider) = providers.get(&area) {
            return Ok(provider.clone());
        }

        let config = self.resolver.resolve(area)?;
        let provider = self.factory.build(&config).await?;
        info!(%area, endpoint = %config.endpoint, "Provider created");
        providers.insert(area, provider.clone());
        Ok(provider)
    }

    /// Run `final_cleanup` on every cached provider and drop the cache.
    ///
    /// Failures are logged and do not stop the remaining providers.
    pub async fn final_cleanup_all(&self) -> usize {
        let providers: Vec<_> = self.providers.lock().await.drain().collect();
        let mut failed = 0;
        for (area, provider) in providers {
            if let Err(e) = provider.final_cleanup().await {
                warn!(%area, error = %e, "Provider cleanup failed");
                failed += 1;
            }
        }
        failed
    }

    pub async fn cached_areas(&self) -> Vec<AreaId> {
        let mut areas: Vec<_> = self.providers.lock().await.keys().copied().collect();
        areas.sort();
        areas
    }
}
