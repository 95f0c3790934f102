// =============================================================================
// Providers — the uniform interface to every external signal source
// =============================================================================
//
// The core treats every provider identically through the `Provider` trait,
// whatever protocol sits behind it.  `ProviderRegistry` maps each data type
// to a primary source and an optional fallback.
// =============================================================================

pub mod demo;
pub mod http_client;
pub mod rate_limit;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ProviderError;
use crate::runtime_config::{DataTypeConfig, RuntimeConfig};
use crate::types::{DataType, SourceId};

pub use demo::DemoProvider;
pub use http_client::HttpJsonProvider;
pub use rate_limit::{RateLimiter, RateLimiterState};

/// One raw observation returned by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReading {
    pub value: f64,
    pub as_of: DateTime<Utc>,
    pub source_id: SourceId,
}

/// Any external source of instrument signals.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Source id, also the rate-limiter and connection-cap key.
    fn id(&self) -> &str;

    async fn fetch(
        &self,
        instrument_id: &str,
        data_type: &str,
        as_of: DateTime<Utc>,
    ) -> Result<SignalReading, ProviderError>;
}

/// Primary and optional fallback source for a data type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub primary: SourceId,
    pub fallback: Option<SourceId>,
}

/// Provider instances plus the data-type routing table.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<SourceId, Arc<dyn Provider>>,
    routes: HashMap<DataType, Route>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build routes from the configured data types.
    pub fn with_routes(data_types: &[DataTypeConfig]) -> Self {
        let mut registry = Self::new();
        for dt in data_types {
            registry.set_route(&dt.name, &dt.primary_source, dt.fallback_source.as_deref());
        }
        registry
    }

    /// Routes from config plus one provider per configured source: HTTP
    /// when it has a `base_url`, the synthetic demo provider otherwise.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let mut registry = Self::with_routes(&config.data_types);
        for source in &config.sources {
            if source.base_url.is_some() {
                registry.register(Arc::new(HttpJsonProvider::from_config(source)?));
                info!(source = %source.id, "http provider registered");
            } else {
                registry.register(Arc::new(DemoProvider::new(source.id.clone())));
                info!(source = %source.id, "demo provider registered (no base_url)");
            }
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn set_route(&mut self, data_type: &str, primary: &str, fallback: Option<&str>) {
        self.routes.insert(
            data_type.to_string(),
            Route {
                primary: primary.to_string(),
                fallback: fallback.map(str::to_string),
            },
        );
    }

    pub fn route(&self, data_type: &str) -> Option<&Route> {
        self.routes.get(data_type)
    }

    pub fn provider(&self, source_id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(source_id).cloned()
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.providers.keys().cloned().collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("routes", &self.routes)
            .finish()
    }
}
