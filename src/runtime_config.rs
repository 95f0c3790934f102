// =============================================================================
// Runtime Configuration — every tunable knob of the engine, atomic save
// =============================================================================
//
// Central configuration hub.  Provider sources, data types, cache TTLs, fetch
// concurrency, parameter definitions, regime profiles and the learning-loop
// policy all live here so that business policy never becomes hardcoded logic.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_refill_rate() -> f64 {
    5.0
}

fn default_burst() -> f64 {
    10.0
}

fn default_max_concurrent() -> usize {
    4
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_scale() -> f64 {
    1.0
}

fn default_memory_capacity() -> usize {
    10_000
}

fn default_ttl_secs() -> u64 {
    3_600
}

fn default_category_ttls() -> HashMap<String, u64> {
    let mut ttls = HashMap::new();
    ttls.insert("price".to_string(), 15 * 60);
    ttls.insert("sentiment".to_string(), 60 * 60);
    ttls.insert("fundamental".to_string(), 24 * 60 * 60);
    ttls.insert("reference".to_string(), 7 * 24 * 60 * 60);
    ttls
}

fn default_global_concurrency() -> usize {
    64
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

fn default_channel_capacity() -> usize {
    256
}

fn default_deadline_secs() -> u64 {
    300
}

fn default_scan_interval_secs() -> u64 {
    900
}

fn default_history_size() -> usize {
    50
}

fn default_universe() -> Vec<String> {
    vec![
        "AAPL".to_string(),
        "MSFT".to_string(),
        "NVDA".to_string(),
        "AMZN".to_string(),
        "TSLA".to_string(),
    ]
}

fn default_feature_data_type() -> String {
    "price".to_string()
}

fn default_stickiness() -> f64 {
    0.90
}

fn default_instability_window() -> usize {
    5
}

fn default_min_regime_confidence() -> f64 {
    0.50
}

fn default_min_samples() -> u64 {
    30
}

fn default_arms() -> usize {
    9
}

fn default_reward_horizon() -> String {
    "1d".to_string()
}

fn default_min_regime_samples() -> u64 {
    20
}

fn default_learning_interval_secs() -> u64 {
    3_600
}

fn default_margin() -> f64 {
    0.002
}

fn default_z() -> f64 {
    1.645
}

fn default_rollout_fraction() -> f64 {
    0.20
}

fn default_shadow_duration_secs() -> u64 {
    3 * 24 * 60 * 60
}

fn default_rollout_duration_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_min_validation_samples() -> usize {
    30
}

fn default_outcome_data_type() -> String {
    "forward_return".to_string()
}

fn default_outcome_source() -> String {
    "market".to_string()
}

fn default_horizons() -> Vec<HorizonDef> {
    vec![
        HorizonDef {
            label: "1h".to_string(),
            secs: 60 * 60,
        },
        HorizonDef {
            label: "1d".to_string(),
            secs: 24 * 60 * 60,
        },
        HorizonDef {
            label: "5d".to_string(),
            secs: 5 * 24 * 60 * 60,
        },
    ]
}

fn default_sources() -> Vec<SourceConfig> {
    ["market", "news", "social", "reference"]
        .iter()
        .map(|id| SourceConfig {
            id: id.to_string(),
            ..SourceConfig::default()
        })
        .collect()
}

fn default_data_types() -> Vec<DataTypeConfig> {
    vec![
        DataTypeConfig::new("price", "price", true, "market"),
        DataTypeConfig::new("volume", "price", false, "market"),
        DataTypeConfig::new("theme_heat", "sentiment", false, "news"),
        DataTypeConfig::new("social_buzz", "sentiment", false, "social"),
        DataTypeConfig::new("catalyst", "fundamental", false, "news"),
        DataTypeConfig::new("sector_strength", "reference", false, "reference"),
    ]
}

fn default_parameters() -> Vec<ParameterDef> {
    vec![
        ParameterDef::weight("price_weight", 0.30),
        ParameterDef::weight("volume_weight", 0.12),
        ParameterDef::weight("theme_heat_weight", 0.18),
        ParameterDef::weight("social_buzz_weight", 0.10),
        ParameterDef::weight("catalyst_weight", 0.20),
        ParameterDef::weight("sector_strength_weight", 0.10),
        ParameterDef::weight("volatile.price_weight", 0.20),
        ParameterDef {
            id: "score_threshold".to_string(),
            category: "threshold".to_string(),
            default: 0.25,
            lower_bound: 0.0,
            upper_bound: 1.0,
            tunable: true,
        },
    ]
}

fn default_profile() -> HashMap<String, String> {
    default_data_types()
        .into_iter()
        .map(|dt| {
            let param = format!("{}_weight", dt.name);
            (dt.name, param)
        })
        .collect()
}

fn default_profiles() -> HashMap<String, HashMap<String, String>> {
    let mut profiles = HashMap::new();
    let mut volatile = HashMap::new();
    volatile.insert("price".to_string(), "volatile.price_weight".to_string());
    profiles.insert("volatile".to_string(), volatile);
    profiles
}

fn default_regime_states() -> Vec<RegimeStateDef> {
    // Feature order: [trend, volatility, dispersion].
    vec![
        RegimeStateDef {
            label: "trending".to_string(),
            mean: vec![0.40, 0.45, 0.25],
            std_dev: vec![0.15, 0.15, 0.12],
        },
        RegimeStateDef {
            label: "choppy".to_string(),
            mean: vec![0.05, 0.20, 0.25],
            std_dev: vec![0.08, 0.10, 0.10],
        },
        RegimeStateDef {
            label: "volatile".to_string(),
            mean: vec![0.05, 0.65, 0.75],
            std_dev: vec![0.20, 0.15, 0.15],
        },
    ]
}

// =============================================================================
// Sources & data types
// =============================================================================

/// One external provider: its call rate, burst and connection cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,

    /// Sustained call rate in tokens per second.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,

    /// Bucket capacity.
    #[serde(default = "default_burst")]
    pub burst: f64,

    /// Simultaneous connections allowed to this source.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// HTTP/JSON endpoint; sources without one must be wired in code.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Name of the env var holding the API key (never the key itself).
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Name of the env var holding the HMAC secret.
    #[serde(default)]
    pub api_secret_env: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            refill_rate: default_refill_rate(),
            burst: default_burst(),
            max_concurrent: default_max_concurrent(),
            base_url: None,
            api_key_env: None,
            api_secret_env: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Maps a raw provider value into `[-1, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationConfig {
    #[serde(default)]
    pub center: f64,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            center: 0.0,
            scale: default_scale(),
        }
    }
}

impl NormalizationConfig {
    pub fn normalize(&self, raw: f64) -> f64 {
        if !raw.is_finite() {
            return 0.0;
        }
        let scale = if self.scale.abs() < f64::EPSILON {
            1.0
        } else {
            self.scale
        };
        ((raw - self.center) / scale).clamp(-1.0, 1.0)
    }
}

/// One signal component and where it comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataTypeConfig {
    pub name: String,

    /// Cache category; selects the TTL.
    pub category: String,

    /// A missing required component fails the instrument.
    #[serde(default)]
    pub required: bool,

    pub primary_source: String,

    #[serde(default)]
    pub fallback_source: Option<String>,

    #[serde(default)]
    pub normalization: NormalizationConfig,
}

impl DataTypeConfig {
    pub fn new(name: &str, category: &str, required: bool, primary_source: &str) -> Self {
        Self {
            name: name.to_string(),
            category: category.to_string(),
            required,
            primary_source: primary_source.to_string(),
            fallback_source: None,
            normalization: NormalizationConfig::default(),
        }
    }
}

// =============================================================================
// Cache, fetch, scan
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries kept in the in-process LRU tier.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,

    /// Directory of the durable tier; `None` keeps it in memory.
    #[serde(default)]
    pub durable_dir: Option<String>,

    /// TTL per cache category, in seconds.
    #[serde(default = "default_category_ttls")]
    pub ttl_secs: HashMap<String, u64>,

    /// TTL for categories missing from `ttl_secs`.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: default_memory_capacity(),
            durable_dir: None,
            ttl_secs: default_category_ttls(),
            default_ttl_secs: default_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, category: &str) -> Duration {
        let secs = self
            .ttl_secs
            .get(category)
            .copied()
            .unwrap_or(self.default_ttl_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Cap on total in-flight provider calls.
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,

    /// Attempts per provider before falling back.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Capacity of the task → collector result channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            global_concurrency: default_global_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl FetchConfig {
    /// Exponential backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.backoff_max_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Hard deadline for one batch.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Cadence of the background scan loop.
    #[serde(default = "default_scan_interval_secs")]
    pub interval_secs: u64,

    /// Instruments scanned by the background loop.
    #[serde(default = "default_universe")]
    pub universe: Vec<String>,

    /// Finished scans retained for `get_scan_result`.
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Whether the background scan loop runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            interval_secs: default_scan_interval_secs(),
            universe: default_universe(),
            history_size: default_history_size(),
            enabled: true,
        }
    }
}

// =============================================================================
// Parameters & profiles
// =============================================================================

/// Definition of a tunable parameter: its default and hard bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDef {
    pub id: String,
    #[serde(default)]
    pub category: String,
    pub default: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    /// Whether the learning loop may propose new values.
    #[serde(default = "default_true")]
    pub tunable: bool,
}

impl ParameterDef {
    pub fn weight(id: &str, default: f64) -> Self {
        Self {
            id: id.to_string(),
            category: "weight".to_string(),
            default,
            lower_bound: 0.0,
            upper_bound: 1.0,
            tunable: true,
        }
    }
}

// =============================================================================
// Regime, learning, validation, outcomes
// =============================================================================

/// Emission model of one regime label (diagonal Gaussian over features).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeStateDef {
    pub label: String,
    pub mean: Vec<f64>,
    pub std_dev: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeConfig {
    #[serde(default = "default_regime_states")]
    pub states: Vec<RegimeStateDef>,

    /// Probability of staying in the same regime between cycles.
    #[serde(default = "default_stickiness")]
    pub stickiness: f64,

    /// Classifications inspected by the instability check.
    #[serde(default = "default_instability_window")]
    pub instability_window: usize,

    /// Below this top-label probability the regime counts as unstable.
    #[serde(default = "default_min_regime_confidence")]
    pub min_confidence: f64,

    /// Data type whose normalized values feed the regime features.
    #[serde(default = "default_feature_data_type")]
    pub feature_data_type: String,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            states: default_regime_states(),
            stickiness: default_stickiness(),
            instability_window: default_instability_window(),
            min_confidence: default_min_regime_confidence(),
            feature_data_type: default_feature_data_type(),
        }
    }
}

/// Which optimizer tier to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerStrategy {
    Bandit,
    RegimeBandit,
    /// Heavy tier that needs an external runtime; falls back to `Noop`.
    Neural,
    Noop,
}

impl Default for OptimizerStrategy {
    fn default() -> Self {
        Self::Bandit
    }
}

/// How a realized outcome becomes a reward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardMode {
    /// The realized value as-is.
    Raw,
    /// Realized value times the sign of the predicted score.
    Directional,
}

impl Default for RewardMode {
    fn default() -> Self {
        Self::Directional
    }
}

impl RewardMode {
    pub fn reward(self, predicted_score: f64, realized: f64) -> f64 {
        match self {
            Self::Raw => realized,
            Self::Directional => {
                if predicted_score > 0.0 {
                    realized
                } else if predicted_score < 0.0 {
                    -realized
                } else {
                    0.0
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub strategy: OptimizerStrategy,

    /// Cold-start guard: outcomes required before any suggestion.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,

    /// Discrete candidate values spread across a parameter's bounds.
    #[serde(default = "default_arms")]
    pub arms: usize,

    /// Outcome horizon that feeds the reward.
    #[serde(default = "default_reward_horizon")]
    pub reward_horizon: String,

    #[serde(default)]
    pub reward_mode: RewardMode,

    /// Below this many samples a regime bandit defers to the pooled one.
    #[serde(default = "default_min_regime_samples")]
    pub min_regime_samples: u64,

    /// Fixed RNG seed; `None` seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Cadence of the learning loop.
    #[serde(default = "default_learning_interval_secs")]
    pub interval_secs: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            strategy: OptimizerStrategy::default(),
            min_samples: default_min_samples(),
            arms: default_arms(),
            reward_horizon: default_reward_horizon(),
            reward_mode: RewardMode::default(),
            min_regime_samples: default_min_regime_samples(),
            seed: None,
            interval_secs: default_learning_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Outcomes needed per arm before a verdict.
    #[serde(default = "default_min_validation_samples")]
    pub min_samples: usize,

    /// Candidate may trail the baseline by at most this much.
    #[serde(default = "default_margin")]
    pub margin: f64,

    /// One-sided z critical value.
    #[serde(default = "default_z")]
    pub z: f64,

    /// Share of scan traffic a rollout candidate receives.
    #[serde(default = "default_rollout_fraction")]
    pub rollout_fraction: f64,

    #[serde(default = "default_shadow_duration_secs")]
    pub shadow_duration_secs: u64,

    #[serde(default = "default_rollout_duration_secs")]
    pub rollout_duration_secs: u64,

    /// Horizon used to compare candidate and baseline outcomes.
    #[serde(default = "default_reward_horizon")]
    pub horizon: String,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_samples: default_min_validation_samples(),
            margin: default_margin(),
            z: default_z(),
            rollout_fraction: default_rollout_fraction(),
            shadow_duration_secs: default_shadow_duration_secs(),
            rollout_duration_secs: default_rollout_duration_secs(),
            horizon: default_reward_horizon(),
        }
    }
}

/// A fixed future offset at which a decision's realized value is measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonDef {
    pub label: String,
    pub secs: u64,
}

impl HorizonDef {
    /// When a decision taken at `decided_at` matures; `None` if that lies
    /// beyond the representable calendar.
    pub fn due_at(&self, decided_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        decided_at.checked_add_signed(span_secs(self.secs))
    }
}

/// Configured seconds as a chrono span, saturating at `TimeDelta::MAX`.
pub fn span_secs(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

/// `now + secs`, saturating at the latest representable instant.
pub fn deadline_after(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    now.checked_add_signed(span_secs(secs))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeConfig {
    #[serde(default = "default_horizons")]
    pub horizons: Vec<HorizonDef>,

    /// Data type requested from the provider to realize an outcome.
    #[serde(default = "default_outcome_data_type")]
    pub outcome_data_type: String,

    #[serde(default = "default_outcome_source")]
    pub outcome_source: String,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            horizons: default_horizons(),
            outcome_data_type: default_outcome_data_type(),
            outcome_source: default_outcome_source(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Root directory for parameters, experiments and outcomes; `None` keeps
    /// everything in memory.
    #[serde(default)]
    pub data_dir: Option<String>,
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Confluence engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,

    /// Default bucket for sources not listed in `sources`.
    #[serde(default)]
    pub default_source: SourceConfig,

    #[serde(default = "default_data_types")]
    pub data_types: Vec<DataTypeConfig>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default = "default_parameters")]
    pub parameters: Vec<ParameterDef>,

    /// Component → parameter id used when the regime has no profile entry.
    #[serde(default = "default_profile")]
    pub default_profile: HashMap<String, String>,

    /// Regime label → (component → parameter id) overrides.
    #[serde(default = "default_profiles")]
    pub profiles: HashMap<String, HashMap<String, String>>,

    /// Parameter id holding the decision threshold.
    #[serde(default = "default_threshold_param")]
    pub threshold_parameter: String,

    #[serde(default)]
    pub regime: RegimeConfig,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub outcomes: OutcomeConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

fn default_threshold_param() -> String {
    "score_threshold".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            default_source: SourceConfig::default(),
            data_types: default_data_types(),
            cache: CacheConfig::default(),
            fetch: FetchConfig::default(),
            scan: ScanConfig::default(),
            parameters: default_parameters(),
            default_profile: default_profile(),
            profiles: default_profiles(),
            threshold_parameter: default_threshold_param(),
            regime: RegimeConfig::default(),
            optimizer: OptimizerConfig::default(),
            validation: ValidationConfig::default(),
            outcomes: OutcomeConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            sources = config.sources.len(),
            data_types = config.data_types.len(),
            parameters = config.parameters.len(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Load `path`, falling back to defaults without touching the file.
    ///
    /// A missing file is seeded with the defaults so operators have a
    /// template to edit.  An unreadable or malformed file is left alone.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            let config = Self::default();
            if let Err(e) = config.save(path) {
                warn!(error = %e, "could not seed default config file");
            }
            return config;
        }
        Self::load(path).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load config, using defaults");
            Self::default()
        })
    }

    /// Every parameter a profile or the threshold refers to must be defined.
    pub fn validate(&self) -> Result<()> {
        let defined: HashSet<&str> = self.parameters.iter().map(|p| p.id.as_str()).collect();
        let mut unknown = BTreeSet::new();

        let regimes = std::iter::once(None).chain(self.profiles.keys().map(|r| Some(r.as_str())));
        for regime in regimes {
            for dt in &self.data_types {
                let id = self.weight_parameter(&dt.name, regime);
                if !defined.contains(id.as_str()) {
                    unknown.insert(id);
                }
            }
        }
        let referenced = self
            .default_profile
            .values()
            .chain(self.profiles.values().flat_map(|p| p.values()))
            .chain(std::iter::once(&self.threshold_parameter));
        for id in referenced {
            if !defined.contains(id.as_str()) {
                unknown.insert(id.clone());
            }
        }

        if !unknown.is_empty() {
            bail!("config references undefined parameters: {unknown:?}");
        }
        Ok(())
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    pub fn data_type(&self, name: &str) -> Option<&DataTypeConfig> {
        self.data_types.iter().find(|d| d.name == name)
    }

    pub fn horizon(&self, label: &str) -> Option<&HorizonDef> {
        self.outcomes.horizons.iter().find(|h| h.label == label)
    }

    /// Resolve the parameter id weighting `component` under `regime`.
    ///
    /// Regime profile first, then the default profile, then the
    /// `<component>_weight` naming convention.
    pub fn weight_parameter(&self, component: &str, regime: Option<&str>) -> String {
        if let Some(id) = regime
            .and_then(|r| self.profiles.get(r))
            .and_then(|p| p.get(component))
        {
            return id.clone();
        }
        self.default_profile
            .get(component)
            .cloned()
            .unwrap_or_else(|| format!("{component}_weight"))
    }
}
