// =============================================================================
// Central Application State — Confluence engine
// =============================================================================
//
// Every service is constructed once here and handed to its collaborators by
// `Arc`.  Nothing is global: tests build as many independent instances as
// they like.
//
// Two background duties are driven from here:
//   - `resolve_due_outcomes`  attaches realized values to past decisions
//   - `run_learning_cycle`    validates open experiments, retrains the
//                             optimizer, and proposes new candidates
//
// Learning failures are logged and never reach the scan path.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::CacheLayer;
use crate::error::OptimizerError;
use crate::fetch::FetchOrchestrator;
use crate::notify::NotificationSink;
use crate::optimizer::{self, build_optimizer, Optimizer};
use crate::outcome::{OutcomeRecord, OutcomeResolver, OutcomeTracker};
use crate::params::{Experiment, Parameter, ParameterRegistry};
use crate::persistence::{JsonDirStore, MemoryStore, Persistence};
use crate::providers::{ProviderRegistry, RateLimiter, SignalReading};
use crate::regime::RegimeClassifier;
use crate::runtime_config::{PersistenceConfig, RuntimeConfig};
use crate::scan::ScanCoordinator;
use crate::validation::{ValidationEngine, ValidationOutcome};

// =============================================================================
// Stores
// =============================================================================

/// Persistence backends for the three durable entities.
#[derive(Clone)]
pub struct Stores {
    pub parameters: Arc<dyn Persistence<Parameter>>,
    pub experiments: Arc<dyn Persistence<Experiment>>,
    pub outcomes: Arc<dyn Persistence<OutcomeRecord>>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            parameters: Arc::new(MemoryStore::new()),
            experiments: Arc::new(MemoryStore::new()),
            outcomes: Arc::new(MemoryStore::new()),
        }
    }

    /// JSON files under `data_dir`, or memory when none is configured.
    pub fn open(config: &PersistenceConfig) -> Result<Self> {
        let Some(dir) = config.data_dir.as_deref() else {
            warn!("no persistence.data_dir configured, state is in-memory only");
            return Ok(Self::in_memory());
        };
        Ok(Self {
            parameters: Arc::new(JsonDirStore::open(dir).context("opening parameter store")?),
            experiments: Arc::new(JsonDirStore::open(dir).context("opening experiment store")?),
            outcomes: Arc::new(JsonDirStore::open(dir).context("opening outcome store")?),
        })
    }
}

// =============================================================================
// Learning report
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Proposal {
    pub parameter_id: String,
    pub experiment_id: String,
    pub candidate_value: f64,
    pub confidence: f64,
}

/// What one learning cycle did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LearningReport {
    pub validations: Vec<ValidationOutcome>,
    pub proposals: Vec<Proposal>,
    pub observations: usize,
    /// Parameters the optimizer had nothing to say about.
    pub skipped: usize,
}

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    /// Bumped by the scan loop and by every learning cycle.
    pub state_version: AtomicU64,

    pub config: Arc<RuntimeConfig>,

    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<CacheLayer<SignalReading>>,
    pub registry: Arc<ParameterRegistry>,
    pub regime: Arc<RegimeClassifier>,
    pub tracker: Arc<OutcomeTracker>,
    pub coordinator: Arc<ScanCoordinator>,
    pub validation: ValidationEngine,
    pub optimizer: Mutex<Box<dyn Optimizer>>,
    resolver: Option<OutcomeResolver>,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire every service from `config`.
    pub fn build(
        config: RuntimeConfig,
        providers: ProviderRegistry,
        sink: Arc<dyn NotificationSink>,
        stores: Stores,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);

        let limiter = Arc::new(RateLimiter::new(&config.sources, &config.default_source));
        let cache = Arc::new(CacheLayer::new(&config.cache).context("building cache layer")?);
        let registry = Arc::new(
            ParameterRegistry::load(&config, stores.parameters, stores.experiments)
                .context("loading parameter registry")?,
        );
        let tracker = Arc::new(
            OutcomeTracker::load(&config.outcomes, stores.outcomes)
                .context("loading outcome tracker")?,
        );
        let regime = RegimeClassifier::new(&config.regime);

        let resolver = match providers.provider(&config.outcomes.outcome_source) {
            Some(provider) => Some(OutcomeResolver::new(
                &config.outcomes,
                tracker.clone(),
                provider,
                limiter.clone(),
            )),
            None => {
                warn!(
                    source = %config.outcomes.outcome_source,
                    "outcome source has no provider, outcomes will not resolve"
                );
                None
            }
        };

        let fetcher = Arc::new(FetchOrchestrator::new(
            &config,
            providers,
            limiter.clone(),
            cache.clone(),
        ));
        let coordinator = ScanCoordinator::new(
            config.clone(),
            fetcher,
            registry.clone(),
            regime.clone(),
            tracker.clone(),
            sink,
        );
        let validation = ValidationEngine::new(
            config.validation.clone(),
            config.optimizer.reward_mode,
            registry.clone(),
            tracker.clone(),
            regime.clone(),
        );
        let optimizer = build_optimizer(&config);
        info!(strategy = optimizer.name(), "optimizer selected");

        Ok(Arc::new(Self {
            state_version: AtomicU64::new(1),
            config,
            limiter,
            cache,
            registry,
            regime,
            tracker,
            coordinator,
            validation,
            optimizer: Mutex::new(optimizer),
            resolver,
            start_time: std::time::Instant::now(),
        }))
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub async fn resolve_due_outcomes(&self, now: DateTime<Utc>) -> usize {
        match &self.resolver {
            Some(resolver) => resolver.resolve_due(now).await,
            None => 0,
        }
    }

    /// Validate, retrain, propose.  Each step tolerates failure of the
    /// previous one; production values only move through the registry.
    pub fn run_learning_cycle(&self, now: DateTime<Utc>) -> LearningReport {
        let mut report = LearningReport::default();
        let mut optimizer = self.optimizer.lock();

        // ── 1. Validate open experiments ────────────────────────────────
        report.validations = self.validation.evaluate_all(now);
        for outcome in &report.validations {
            if let ValidationOutcome::RolledBack {
                parameter_id,
                candidate_value,
                ..
            } = outcome
            {
                optimizer.on_rejected(parameter_id, *candidate_value);
            }
        }

        // ── 2. Retrain on every resolved outcome ────────────────────────
        let records = self.tracker.resolved(&self.config.optimizer.reward_horizon);
        let observations = optimizer::observations(&self.config, &records);
        report.observations = observations.len();
        let parameters = match self.registry.status(None) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "cannot read parameters, skipping proposals");
                return report;
            }
        };
        optimizer.train(&parameters, &observations);

        // ── 3. Propose for idle tunable parameters ──────────────────────
        let regime = self.regime.active_label();
        for parameter in self.registry.tunable_idle() {
            let suggestion = match optimizer.suggest(&parameter, regime.as_deref()) {
                Ok(s) => s,
                Err(OptimizerError::InsufficientData {
                    samples, required, ..
                }) => {
                    debug!(parameter = %parameter.id, samples, required, "cold start");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    debug!(parameter = %parameter.id, error = %e, "no suggestion");
                    report.skipped += 1;
                    continue;
                }
            };

            if let Err(e) = self
                .registry
                .set_confidence(&parameter.id, suggestion.confidence)
            {
                warn!(parameter = %parameter.id, error = %e, "failed to record confidence");
            }
            match self.registry.propose(&parameter.id, suggestion.value) {
                Ok(experiment_id) => report.proposals.push(Proposal {
                    parameter_id: parameter.id.clone(),
                    experiment_id,
                    candidate_value: suggestion.value,
                    confidence: suggestion.confidence,
                }),
                Err(e) => {
                    warn!(
                        parameter = %parameter.id,
                        candidate = suggestion.value,
                        error = %e,
                        "proposal rejected"
                    );
                    optimizer.on_rejected(&parameter.id, suggestion.value);
                }
            }
        }

        info!(
            validations = report.validations.len(),
            proposals = report.proposals.len(),
            observations = report.observations,
            skipped = report.skipped,
            "learning cycle complete"
        );
        self.increment_version();
        report
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("state_version", &self.current_state_version())
            .field("decisions", &self.tracker.len())
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::TracingSink;
    use crate::types::ParameterStatus;

    fn state(config: RuntimeConfig) -> Arc<AppState> {
        let mut config = config;
        config.default_source.refill_rate = 1_000_000.0;
        config.default_source.burst = 1_000_000.0;
        for s in &mut config.sources {
            s.refill_rate = 1_000_000.0;
            s.burst = 1_000_000.0;
        }
        let providers = ProviderRegistry::from_config(&config).unwrap();
        AppState::build(config, providers, Arc::new(TracingSink), Stores::in_memory()).unwrap()
    }

    #[tokio::test]
    async fn cold_start_learning_cycle_proposes_nothing() {
        let s = state(RuntimeConfig::default());
        s.coordinator.run_scan("scan-1", vec![]).await;
        let report = s.run_learning_cycle(Utc::now());
        assert!(report.proposals.is_empty());
        assert_eq!(report.observations, 0);
        assert_eq!(report.skipped, 8);
        assert!(s
            .registry
            .status(None)
            .unwrap()
            .iter()
            .all(|p| p.status == ParameterStatus::Static));
    }

    #[tokio::test]
    async fn outcomes_resolve_through_demo_provider() {
        let s = state(RuntimeConfig::default());
        let batch = s.coordinator.run_scan("scan-1", vec![]).await;
        let decisions = batch.results.iter().filter(|r| r.decision_id.is_some()).count();
        assert!(decisions > 0);

        let attached = s
            .resolve_due_outcomes(Utc::now() + chrono::Duration::days(6))
            .await;
        // Three horizons per decision.
        assert_eq!(attached, decisions * 3);
    }

    #[tokio::test]
    async fn learning_cycle_proposes_once_data_accumulates() {
        let mut cfg = RuntimeConfig::default();
        cfg.optimizer.min_samples = 5;
        cfg.optimizer.seed = Some(42);
        cfg.scan.universe = (0..20).map(|i| format!("I{i:02}")).collect();
        let s = state(cfg);

        s.coordinator.run_scan("scan-1", vec![]).await;
        s.resolve_due_outcomes(Utc::now() + chrono::Duration::days(2))
            .await;
        let report = s.run_learning_cycle(Utc::now());
        assert!(report.observations > 0);
        for p in &report.proposals {
            let param = s.registry.parameter(&p.parameter_id).unwrap();
            assert_eq!(param.status, ParameterStatus::Shadow);
            assert!(param.in_bounds(p.candidate_value));
        }
        assert_eq!(report.proposals.len() + report.skipped, 8);
    }
}
