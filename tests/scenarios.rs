// =============================================================================
// End-to-end scenarios
// =============================================================================
//
// Each test wires a fresh engine through the public API with an in-process
// provider, so no network or shared state is involved.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use confluence::cache::CacheLayer;
use confluence::error::{ProviderError, RegistryError};
use confluence::fetch::FetchOrchestrator;
use confluence::notify::TracingSink;
use confluence::params::{ExperimentStage, Variant};
use confluence::providers::{Provider, ProviderRegistry, RateLimiter, SignalReading};
use confluence::regime::FeatureVector;
use confluence::runtime_config::{DataTypeConfig, RewardMode, SourceConfig};
use confluence::types::{InstrumentStatus, MissingReason, ParameterStatus};
use confluence::validation::ValidationOutcome;
use confluence::{AppState, RuntimeConfig, Stores};

// =============================================================================
// Fixtures
// =============================================================================

/// In-process provider: a fixed value per instrument, with configurable
/// gaps and hangs.
struct Table {
    absent: Vec<(String, String)>,
    hang: HashSet<(String, String)>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl Table {
    fn new() -> Self {
        Self {
            absent: Vec::new(),
            hang: HashSet::new(),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn value_of(instrument_id: &str) -> f64 {
        match instrument_id {
            "X" => 0.5,
            "Z" => 0.2,
            _ => 0.1,
        }
    }
}

#[async_trait]
impl Provider for Table {
    fn id(&self) -> &str {
        "table"
    }

    async fn fetch(
        &self,
        instrument_id: &str,
        data_type: &str,
        as_of: DateTime<Utc>,
    ) -> Result<SignalReading, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = (instrument_id.to_string(), data_type.to_string());
        if self.hang.contains(&key) {
            return std::future::pending().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.absent.contains(&key) {
            return Err(ProviderError::not_found("table", instrument_id, data_type));
        }
        Ok(SignalReading {
            value: Self::value_of(instrument_id),
            as_of,
            source_id: "table".into(),
        })
    }
}

fn fast_config() -> RuntimeConfig {
    let mut cfg = RuntimeConfig::default();
    cfg.sources.clear();
    cfg.default_source.refill_rate = 1_000_000.0;
    cfg.default_source.burst = 1_000_000.0;
    cfg.default_source.max_concurrent = 1_024;
    cfg.fetch.global_concurrency = 1_024;
    cfg.outcomes.outcome_source = "table".into();
    cfg
}

fn engine(cfg: RuntimeConfig, table: Arc<Table>) -> Arc<AppState> {
    let mut providers = ProviderRegistry::new();
    providers.register(table);
    for dt in &cfg.data_types {
        providers.set_route(&dt.name, "table", None);
    }
    AppState::build(cfg, providers, Arc::new(TracingSink), Stores::in_memory())
        .expect("engine builds")
}

fn names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("I{i:03}")).collect()
}

// =============================================================================
// 1. Token bucket: burst then steady rate
// =============================================================================

#[tokio::test(start_paused = true)]
async fn burst_then_refill_rate() {
    let source = SourceConfig {
        id: "slow".into(),
        refill_rate: 3.0,
        burst: 5.0,
        ..SourceConfig::default()
    };
    let limiter = RateLimiter::new(&[source], &SourceConfig::default());

    for _ in 0..5 {
        let grant = limiter.acquire("slow", 1).await;
        assert!(grant.waited.is_zero());
    }

    let sixth = limiter.acquire("slow", 1).await;
    let ms = sixth.waited.as_millis();
    assert!((330..=337).contains(&ms), "sixth waited {ms}ms");

    // Grants over any window stay within burst + rate * t.
    let start = tokio::time::Instant::now();
    for _ in 0..15 {
        limiter.acquire("slow", 1).await;
    }
    assert!(start.elapsed() >= Duration::from_millis(4_990));
}

// =============================================================================
// 2. Concurrent fetches for one key coalesce
// =============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_fetches_share_one_call() {
    let cfg = fast_config();
    let mut table = Table::new();
    table.delay = Some(Duration::from_millis(50));
    let table = Arc::new(table);

    let mut providers = ProviderRegistry::with_routes(&[DataTypeConfig::new(
        "price", "price", true, "table",
    )]);
    providers.register(table.clone());
    let limiter = Arc::new(RateLimiter::new(&cfg.sources, &cfg.default_source));
    let cache = Arc::new(CacheLayer::new(&cfg.cache).expect("cache"));
    let orch = Arc::new(FetchOrchestrator::new(&cfg, providers, limiter, cache.clone()));

    let ids = vec!["X".to_string()];
    let dts = vec!["price".to_string()];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let as_of = Utc::now();
    let (a, b, c) = tokio::join!(
        orch.fetch_all(&ids, &dts, as_of, deadline),
        orch.fetch_all(&ids, &dts, as_of, deadline),
        orch.fetch_all(&ids, &dts, as_of, deadline),
    );

    assert_eq!(table.calls.load(Ordering::SeqCst), 1);
    let values: Vec<_> = [a, b, c]
        .iter()
        .map(|r| r["X"].value("price"))
        .collect();
    assert_eq!(values, vec![Some(0.5); 3]);
    assert_eq!(cache.stats().misses, 1);
}

// =============================================================================
// 3. Proposals respect bounds
// =============================================================================

#[tokio::test]
async fn out_of_bounds_rejected_in_bounds_shadowed() {
    let state = engine(fast_config(), Arc::new(Table::new()));

    match state.registry.propose("theme_heat_weight", 1.3) {
        Err(RegistryError::ParameterOutOfBounds { lower, upper, .. }) => {
            assert_eq!((lower, upper), (0.0, 1.0));
        }
        other => panic!("expected out-of-bounds, got {other:?}"),
    }
    let p = state.registry.parameter("theme_heat_weight").unwrap();
    assert_eq!(p.status, ParameterStatus::Static);
    assert!(p.active_experiment.is_none());

    let exp_id = state.registry.propose("theme_heat_weight", 0.25).unwrap();
    let exp = state.registry.experiment(&exp_id).unwrap();
    assert_eq!(exp.stage, ExperimentStage::Shadow);
    assert_eq!(exp.candidate_value, 0.25);
    assert_eq!(exp.baseline_value, 0.18);

    let p = state.registry.parameter("theme_heat_weight").unwrap();
    assert_eq!(p.status, ParameterStatus::Shadow);
    assert_eq!(state.registry.get_active("theme_heat_weight", None), Some(0.18));
}

// =============================================================================
// 4. Missing components: degraded vs failed
// =============================================================================

#[tokio::test]
async fn optional_gap_degrades_required_gap_fails() {
    let mut table = Table::new();
    table.absent = vec![
        ("X".into(), "social_buzz".into()),
        ("Y".into(), "price".into()),
    ];
    let state = engine(fast_config(), Arc::new(table));

    let batch = state
        .coordinator
        .run_scan("scan-gaps", vec!["X".into(), "Y".into(), "Z".into()])
        .await;
    let get = |id: &str| {
        batch
            .results
            .iter()
            .find(|r| r.instrument_id == id)
            .unwrap()
    };

    let x = get("X");
    assert_eq!(x.status, InstrumentStatus::Degraded);
    assert_eq!(x.missing.get("social_buzz"), Some(&MissingReason::NotFound));
    let buzz = x
        .contributions
        .iter()
        .find(|c| c.data_type == "social_buzz")
        .unwrap();
    assert_eq!(buzz.signal, 0.0);
    assert_eq!(buzz.contribution, 0.0);
    assert_eq!(buzz.missing, Some(MissingReason::NotFound));
    assert_eq!(x.rank, Some(1));

    let y = get("Y");
    assert_eq!(y.status, InstrumentStatus::Failed);
    assert_eq!(y.rank, None);
    assert!(y.composite_score.is_none());

    let z = get("Z");
    assert_eq!(z.status, InstrumentStatus::Scored);
    assert_eq!(z.rank, Some(2));
    assert_eq!(batch.results.last().unwrap().instrument_id, "Y");
}

// =============================================================================
// 5. Deadline bounds a large scan
// =============================================================================

#[tokio::test(start_paused = true)]
async fn deadline_completes_large_scan_with_hung_instruments() {
    let universe = names(500);
    let mut table = Table::new();
    table.hang = universe
        .iter()
        .take(50)
        .map(|id| (id.clone(), "price".to_string()))
        .collect();
    let mut cfg = fast_config();
    cfg.scan.deadline_secs = 300;
    let state = engine(cfg, Arc::new(table));

    let start = tokio::time::Instant::now();
    let batch = state.coordinator.run_scan("scan-big", universe.clone()).await;
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(300));
    assert!(elapsed < Duration::from_secs(301), "took {elapsed:?}");

    assert_eq!(batch.results.len(), 500);
    assert!(batch.results.iter().all(|r| r.status.is_terminal()));
    let summary = batch.summary.unwrap();
    assert_eq!(summary.failed, 50);
    assert_eq!(summary.scored, 450);
    assert!(summary.timed_out);

    let hung: HashSet<&str> = universe.iter().take(50).map(String::as_str).collect();
    for r in &batch.results {
        if hung.contains(r.instrument_id.as_str()) {
            assert_eq!(r.status, InstrumentStatus::Failed);
            assert_eq!(r.missing.get("price"), Some(&MissingReason::TimedOut));
        }
    }
}

// =============================================================================
// 6. Underperforming rollout is rolled back automatically
// =============================================================================

#[tokio::test]
async fn underperforming_rollout_rolls_back_to_prior_value() {
    let mut cfg = fast_config();
    cfg.validation.min_samples = 5;
    cfg.validation.rollout_fraction = 0.5;
    cfg.optimizer.reward_mode = RewardMode::Raw;
    cfg.optimizer.strategy = confluence::runtime_config::OptimizerStrategy::Noop;
    cfg.regime.instability_window = 3;
    let state = engine(cfg, Arc::new(Table::new()));

    let exp = state.registry.propose("theme_heat_weight", 0.25).unwrap();
    assert_eq!(
        state.registry.promote(&exp).unwrap(),
        ParameterStatus::Rollout
    );

    let universe = names(40);
    let (mut candidate, mut baseline) = (0, 0);
    for scan in ["s1", "s2", "s3"] {
        let batch = state.coordinator.run_scan(scan, universe.clone()).await;
        for (i, r) in batch.results.iter().enumerate() {
            let decision = r.decision_id.as_ref().unwrap();
            let jitter = (i % 2) as f64 * 0.001;
            let realized = if r.variant.is_candidate_for(&exp) {
                candidate += 1;
                -0.010 + jitter
            } else {
                assert_eq!(r.variant, Variant::LiveBaseline);
                baseline += 1;
                0.010 + jitter
            };
            state.tracker.attach_outcome(decision, "1d", realized).unwrap();
        }
    }
    assert!(candidate >= 5 && baseline >= 5, "{candidate} / {baseline}");

    let trending = FeatureVector {
        trend: 0.40,
        volatility: 0.45,
        dispersion: 0.25,
    };
    for _ in 0..3 {
        state.regime.classify(&trending);
    }
    assert!(!state.regime.is_unstable());

    let report = state.run_learning_cycle(Utc::now());
    assert!(report.validations.iter().any(|v| matches!(
        v,
        ValidationOutcome::RolledBack { experiment_id, restored_value, .. }
            if *experiment_id == exp && (*restored_value - 0.18).abs() < 1e-12
    )));

    let p = state.registry.parameter("theme_heat_weight").unwrap();
    assert_eq!(p.status, ParameterStatus::Static);
    assert!((p.value - 0.18).abs() < 1e-12);
    assert!(p.active_experiment.is_none());
    assert!(!state.registry.experiment(&exp).unwrap().is_open());

    // Later scans no longer see the candidate.
    let after = state.coordinator.run_scan("s4", universe).await;
    assert!(after
        .results
        .iter()
        .all(|r| r.variant == Variant::LiveBaseline));
}
