// =============================================================================
// Fetch Orchestrator — bounded fan-out over rate-limited providers
// =============================================================================
//
// One cancellable task per (instrument, data type).  Each task goes
// through the cache; only a miss reaches the provider chain:
//
//   rate limiter → per-source connection permit → global permit → provider
//
// `unavailable` is retried with exponential backoff up to `max_attempts`,
// then the fallback source is tried the same way.  `not_found` ends the
// chain immediately.
//
// Results stream through a bounded mpsc channel to a single collector that
// waits against one deadline.  At the deadline every task still running is
// aborted and its component recorded as `timed_out`.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::PartialResult;
use crate::cache::CacheLayer;
use crate::error::ProviderError;
use crate::providers::{ProviderRegistry, RateLimiter, SignalReading};
use crate::runtime_config::{FetchConfig, RuntimeConfig};
use crate::types::{DataType, InstrumentId, MissingReason, SourceId};

type TaskMessage = (InstrumentId, DataType, Result<SignalReading, MissingReason>);

pub struct FetchOrchestrator {
    providers: ProviderRegistry,
    limiter: Arc<RateLimiter>,
    cache: Arc<CacheLayer<SignalReading>>,
    global: Arc<Semaphore>,
    connections: DashMap<SourceId, Arc<Semaphore>>,
    default_connections: usize,
    categories: HashMap<DataType, String>,
    config: FetchConfig,
}

impl FetchOrchestrator {
    pub fn new(
        config: &RuntimeConfig,
        providers: ProviderRegistry,
        limiter: Arc<RateLimiter>,
        cache: Arc<CacheLayer<SignalReading>>,
    ) -> Self {
        let connections = DashMap::new();
        for source in &config.sources {
            connections.insert(
                source.id.clone(),
                Arc::new(Semaphore::new(source.max_concurrent.max(1))),
            );
        }
        let categories = config
            .data_types
            .iter()
            .map(|d| (d.name.clone(), d.category.clone()))
            .collect();

        Self {
            providers,
            limiter,
            cache,
            global: Arc::new(Semaphore::new(config.fetch.global_concurrency.max(1))),
            connections,
            default_connections: config.default_source.max_concurrent.max(1),
            categories,
            config: config.fetch.clone(),
        }
    }

    /// Fetch every data type for every instrument, returning whatever
    /// arrived before `deadline`.  Every requested pair ends up either in
    /// `readings` or in `missing`.
    pub async fn fetch_all(
        self: &Arc<Self>,
        instrument_ids: &[InstrumentId],
        data_types: &[DataType],
        as_of: DateTime<Utc>,
        deadline: Instant,
    ) -> HashMap<InstrumentId, PartialResult> {
        let mut results: HashMap<InstrumentId, PartialResult> = instrument_ids
            .iter()
            .map(|id| (id.clone(), PartialResult::default()))
            .collect();

        let (tx, mut rx) = mpsc::channel::<TaskMessage>(self.config.channel_capacity.max(1));
        let mut tasks = JoinSet::new();
        let mut pending: HashSet<(InstrumentId, DataType)> = HashSet::new();

        for instrument_id in results.keys() {
            for data_type in data_types {
                if !pending.insert((instrument_id.clone(), data_type.clone())) {
                    continue;
                }
                let this = Arc::clone(self);
                let tx = tx.clone();
                let instrument_id = instrument_id.clone();
                let data_type = data_type.clone();
                tasks.spawn(async move {
                    let outcome = this.fetch_one(&instrument_id, &data_type, as_of).await;
                    // Collector gone means the deadline passed; nothing to do.
                    let _ = tx.send((instrument_id, data_type, outcome)).await;
                });
            }
        }
        drop(tx);

        let total = pending.len();
        let mut timed_out = false;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((instrument_id, data_type, outcome))) => {
                    pending.remove(&(instrument_id.clone(), data_type.clone()));
                    if let Some(entry) = results.get_mut(&instrument_id) {
                        entry.record(data_type, outcome);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        tasks.abort_all();
        for (instrument_id, data_type) in pending.drain() {
            if let Some(entry) = results.get_mut(&instrument_id) {
                entry.record(data_type, Err(MissingReason::TimedOut));
            }
        }

        if timed_out {
            warn!(total, "fetch deadline reached, remaining tasks aborted");
        } else {
            debug!(total, "fetch batch complete");
        }
        results
    }

    /// Cache first; a miss runs the full provider chain once per key.
    async fn fetch_one(
        &self,
        instrument_id: &str,
        data_type: &str,
        as_of: DateTime<Utc>,
    ) -> Result<SignalReading, MissingReason> {
        let key = format!("{data_type}:{instrument_id}");
        let category = self
            .categories
            .get(data_type)
            .map(String::as_str)
            .unwrap_or(data_type);

        self.cache
            .get_or_fetch(&key, category, || {
                self.fetch_from_providers(instrument_id, data_type, as_of)
            })
            .await
            .map_err(|e| match e {
                ProviderError::NotFound { .. } => MissingReason::NotFound,
                ProviderError::Unavailable { .. } => MissingReason::Unavailable,
            })
    }

    async fn fetch_from_providers(
        &self,
        instrument_id: &str,
        data_type: &str,
        as_of: DateTime<Utc>,
    ) -> Result<SignalReading, ProviderError> {
        let Some(route) = self.providers.route(data_type).cloned() else {
            warn!(data_type, "no provider route configured");
            return Err(ProviderError::not_found("none", instrument_id, data_type));
        };

        let primary = self
            .call_with_retry(&route.primary, instrument_id, data_type, as_of)
            .await;

        match (primary, route.fallback) {
            (Err(err @ ProviderError::Unavailable { .. }), Some(fallback)) => {
                info!(
                    instrument = instrument_id,
                    data_type,
                    primary = %route.primary,
                    fallback = %fallback,
                    error = %err,
                    "primary exhausted, trying fallback"
                );
                self.call_with_retry(&fallback, instrument_id, data_type, as_of)
                    .await
            }
            (result, _) => result,
        }
    }

    async fn call_with_retry(
        &self,
        source_id: &str,
        instrument_id: &str,
        data_type: &str,
        as_of: DateTime<Utc>,
    ) -> Result<SignalReading, ProviderError> {
        let Some(provider) = self.providers.provider(source_id) else {
            return Err(ProviderError::unavailable(source_id, "provider not registered"));
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = {
                self.limiter.acquire(source_id, 1).await;
                let connections = self.connection_pool(source_id);
                let _conn = connections
                    .acquire()
                    .await
                    .map_err(|_| ProviderError::unavailable(source_id, "connection pool closed"))?;
                let _slot = self
                    .global
                    .acquire()
                    .await
                    .map_err(|_| ProviderError::unavailable(source_id, "fetch pool closed"))?;
                provider.fetch(instrument_id, data_type, as_of).await
            };

            match result {
                Ok(reading) => return Ok(reading),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let backoff = self.config.backoff(attempt);
                    debug!(
                        source = source_id,
                        instrument = instrument_id,
                        data_type,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "provider unavailable, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn connection_pool(&self, source_id: &str) -> Arc<Semaphore> {
        self.connections
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.default_connections)))
            .clone()
    }
}

impl std::fmt::Debug for FetchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOrchestrator")
            .field("providers", &self.providers)
            .field("global_available", &self.global.available_permits())
            .finish()
    }
}
