// =============================================================================
// Regime Classifier — online HMM forward filter
// =============================================================================
//
// Once per scan cycle:
//
//   prior(i)     = Σ_j posterior(j) · T(j → i)
//   T(j → i)     = stickiness                 if i == j
//                  (1 − stickiness)/(n − 1)   otherwise
//   posterior(i) ∝ prior(i) · Π_d N(x_d; μ_i,d, σ_i,d)
//
// Evaluated in log space.  If every label's likelihood underflows or the
// features are not finite, the posterior is the predicted prior.
//
// Labels and emission parameters come from config, so the label set is
// not fixed in code.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::f64::consts::PI;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::features::{FeatureVector, FEATURE_DIM};
use crate::runtime_config::{RegimeConfig, RegimeStateDef};

const MIN_STD_DEV: f64 = 1e-6;

/// Posterior over regime labels at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeState {
    /// Most probable label.
    pub label: String,
    /// Full distribution; sums to 1.
    pub probabilities: BTreeMap<String, f64>,
    pub as_of: DateTime<Utc>,
    #[serde(default)]
    pub features: Option<FeatureVector>,
}

impl RegimeState {
    pub fn confidence(&self) -> f64 {
        self.probabilities.get(&self.label).copied().unwrap_or(0.0)
    }
}

struct Emission {
    label: String,
    mean: [f64; FEATURE_DIM],
    std_dev: [f64; FEATURE_DIM],
}

impl Emission {
    fn from_def(def: &RegimeStateDef) -> Self {
        let pick = |v: &[f64], i: usize, fallback: f64| v.get(i).copied().unwrap_or(fallback);
        let mut mean = [0.0; FEATURE_DIM];
        let mut std_dev = [1.0; FEATURE_DIM];
        for d in 0..FEATURE_DIM {
            mean[d] = pick(&def.mean, d, 0.0);
            std_dev[d] = pick(&def.std_dev, d, 1.0).abs().max(MIN_STD_DEV);
        }
        Self {
            label: def.label.clone(),
            mean,
            std_dev,
        }
    }

    fn log_pdf(&self, x: &[f64; FEATURE_DIM]) -> f64 {
        (0..FEATURE_DIM)
            .map(|d| {
                let z = (x[d] - self.mean[d]) / self.std_dev[d];
                -0.5 * z * z - self.std_dev[d].ln() - 0.5 * (2.0 * PI).ln()
            })
            .sum()
    }
}

/// Posterior, recent history and step count move together under one lock.
struct FilterState {
    current: RegimeState,
    history: VecDeque<RegimeState>,
    steps: u64,
}

pub struct RegimeClassifier {
    emissions: Vec<Emission>,
    stickiness: f64,
    instability_window: usize,
    min_confidence: f64,
    state: Mutex<FilterState>,
}

impl RegimeClassifier {
    pub fn new(config: &RegimeConfig) -> Arc<Self> {
        let defs = if config.states.is_empty() {
            warn!("no regime states configured, using built-in defaults");
            RegimeConfig::default().states
        } else {
            config.states.clone()
        };
        let emissions: Vec<Emission> = defs.iter().map(Emission::from_def).collect();

        let uniform = 1.0 / emissions.len() as f64;
        let probabilities: BTreeMap<String, f64> = emissions
            .iter()
            .map(|e| (e.label.clone(), uniform))
            .collect();
        let initial = RegimeState {
            label: emissions[0].label.clone(),
            probabilities,
            as_of: Utc::now(),
            features: None,
        };

        Arc::new(Self {
            emissions,
            stickiness: config.stickiness.clamp(0.0, 1.0),
            instability_window: config.instability_window.max(1),
            min_confidence: config.min_confidence,
            state: Mutex::new(FilterState {
                current: initial,
                history: VecDeque::new(),
                steps: 0,
            }),
        })
    }

    pub fn labels(&self) -> Vec<String> {
        self.emissions.iter().map(|e| e.label.clone()).collect()
    }

    /// Advance the filter one step with this cycle's features.
    pub fn classify(&self, features: &FeatureVector) -> RegimeState {
        let mut filter = self.state.lock();
        let previous = &filter.current;
        let n = self.emissions.len();

        let prev_probs: Vec<f64> = self
            .emissions
            .iter()
            .map(|e| previous.probabilities.get(&e.label).copied().unwrap_or(0.0))
            .collect();
        let prior = self.predict(&prev_probs);

        let x = features.as_array();
        let log_post: Vec<f64> = if x.iter().all(|v| v.is_finite()) {
            self.emissions
                .iter()
                .zip(&prior)
                .map(|(e, p)| p.max(1e-300).ln() + e.log_pdf(&x))
                .collect()
        } else {
            vec![f64::NEG_INFINITY; n]
        };

        let posterior = normalize_log(&log_post).unwrap_or_else(|| {
            debug!("degenerate regime likelihoods, keeping predicted prior");
            prior.clone()
        });

        let best = posterior
            .iter()
            .enumerate()
            .fold(0, |best, (i, p)| if *p > posterior[best] { i } else { best });

        let state = RegimeState {
            label: self.emissions[best].label.clone(),
            probabilities: self
                .emissions
                .iter()
                .zip(&posterior)
                .map(|(e, p)| (e.label.clone(), *p))
                .collect(),
            as_of: Utc::now(),
            features: Some(*features),
        };

        if state.label != previous.label {
            info!(
                from = %previous.label,
                to = %state.label,
                confidence = format!("{:.3}", state.confidence()),
                "regime changed"
            );
        } else {
            debug!(
                regime = %state.label,
                confidence = format!("{:.3}", state.confidence()),
                trend = format!("{:.3}", features.trend),
                volatility = format!("{:.3}", features.volatility),
                dispersion = format!("{:.3}", features.dispersion),
                "regime classified"
            );
        }

        filter.current = state.clone();
        filter.history.push_back(state.clone());
        while filter.history.len() > self.instability_window {
            filter.history.pop_front();
        }
        filter.steps += 1;
        state
    }

    /// Latest posterior (uniform before the first classification).
    pub fn current(&self) -> RegimeState {
        self.state.lock().current.clone()
    }

    /// Filter steps taken so far.
    pub fn steps(&self) -> u64 {
        self.state.lock().steps
    }

    /// Label used to select the parameter profile; `None` until the first
    /// classification.
    pub fn active_label(&self) -> Option<String> {
        let filter = self.state.lock();
        if filter.history.is_empty() {
            None
        } else {
            Some(filter.current.label.clone())
        }
    }

    /// True when the label flipped within the instability window, the top
    /// probability is below `min_confidence`, or nothing has been observed.
    pub fn is_unstable(&self) -> bool {
        let filter = self.state.lock();
        let history = &filter.history;
        let Some(last) = history.back() else {
            return true;
        };
        if last.confidence() < self.min_confidence {
            return true;
        }
        history.iter().any(|s| s.label != last.label)
    }

    pub fn history(&self) -> Vec<RegimeState> {
        self.state.lock().history.iter().cloned().collect()
    }

    fn predict(&self, prev: &[f64]) -> Vec<f64> {
        let n = prev.len();
        if n == 1 {
            return vec![1.0];
        }
        let stay = self.stickiness;
        let switch = (1.0 - stay) / (n - 1) as f64;
        let raw: Vec<f64> = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| prev[j] * if i == j { stay } else { switch })
                    .sum::<f64>()
            })
            .collect();
        let total: f64 = raw.iter().sum();
        if total > 0.0 && total.is_finite() {
            raw.into_iter().map(|p| p / total).collect()
        } else {
            vec![1.0 / n as f64; n]
        }
    }
}

/// Log-sum-exp normalisation; `None` if nothing is finite.
fn normalize_log(log_p: &[f64]) -> Option<Vec<f64>> {
    let max = log_p
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return None;
    }
    let weights: Vec<f64> = log_p
        .iter()
        .map(|v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let total: f64 = weights.iter().sum();
    Some(weights.into_iter().map(|w| w / total).collect())
}

impl std::fmt::Debug for RegimeClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegimeClassifier")
            .field("labels", &self.labels())
            .field("current", &self.state.lock().current.label)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn features(trend: f64, volatility: f64, dispersion: f64) -> FeatureVector {
        FeatureVector {
            trend,
            volatility,
            dispersion,
        }
    }

    fn sums_to_one(state: &RegimeState) -> bool {
        (state.probabilities.values().sum::<f64>() - 1.0).abs() < 1e-6
    }

    #[test]
    fn starts_uniform_and_unstable() {
        let c = RegimeClassifier::new(&RegimeConfig::default());
        let s = c.current();
        assert!(sums_to_one(&s));
        assert!(c.is_unstable());
        assert!(c.active_label().is_none());
    }

    #[test]
    fn recognises_configured_regimes() {
        let c = RegimeClassifier::new(&RegimeConfig::default());
        for _ in 0..3 {
            c.classify(&features(0.40, 0.45, 0.25));
        }
        assert_eq!(c.current().label, "trending");

        let c = RegimeClassifier::new(&RegimeConfig::default());
        for _ in 0..3 {
            c.classify(&features(0.05, 0.65, 0.75));
        }
        assert_eq!(c.current().label, "volatile");
    }

    #[test]
    fn probabilities_always_sum_to_one() {
        let c = RegimeClassifier::new(&RegimeConfig::default());
        let inputs = [
            features(0.4, 0.45, 0.25),
            features(50.0, -3.0, 9.0),
            features(f64::NAN, 0.1, 0.1),
            features(0.05, 0.2, 0.25),
        ];
        for f in &inputs {
            let s = c.classify(f);
            assert!(sums_to_one(&s), "{:?}", s.probabilities);
            assert!(s.probabilities.values().all(|p| (0.0..=1.0).contains(p)));
        }
    }

    #[test]
    fn degenerate_features_keep_prior() {
        let c = RegimeClassifier::new(&RegimeConfig::default());
        let before = c.classify(&features(0.4, 0.45, 0.25));
        let after = c.classify(&features(f64::NAN, f64::NAN, f64::NAN));
        assert_eq!(before.label, after.label);
        assert!(sums_to_one(&after));
    }

    #[test]
    fn stickiness_damps_single_outlier() {
        let config = RegimeConfig {
            stickiness: 0.99,
            ..RegimeConfig::default()
        };
        let c = RegimeClassifier::new(&config);
        for _ in 0..10 {
            c.classify(&features(0.40, 0.45, 0.25));
        }
        let p_before = c.current().probabilities["trending"];
        let s = c.classify(&features(0.15, 0.35, 0.30));
        assert!(s.probabilities["trending"] < p_before);
        assert!(sums_to_one(&s));
    }

    #[test]
    fn concurrent_classifications_all_advance_the_filter() {
        let c = RegimeClassifier::new(&RegimeConfig::default());
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..500 {
                        c.classify(&features(0.40, 0.45, 0.25));
                    }
                });
            }
        });
        assert_eq!(c.steps(), 1_000);
        let history = c.history();
        assert_eq!(history.len(), RegimeConfig::default().instability_window.max(1));
        assert!(history.iter().all(|s| s.label == "trending"));
        assert!(!c.is_unstable());

        let sequential = RegimeClassifier::new(&RegimeConfig::default());
        for _ in 0..1_000 {
            sequential.classify(&features(0.40, 0.45, 0.25));
        }
        for (label, p) in &sequential.current().probabilities {
            assert!((c.current().probabilities[label] - p).abs() < 1e-9);
        }
    }

    #[test]
    fn flips_within_window_are_unstable() {
        let c = RegimeClassifier::new(&RegimeConfig::default());
        for _ in 0..5 {
            c.classify(&features(0.40, 0.45, 0.25));
        }
        assert!(!c.is_unstable());
        for _ in 0..3 {
            c.classify(&features(0.05, 0.65, 0.75));
        }
        assert!(c.is_unstable());
        for _ in 0..5 {
            c.classify(&features(0.05, 0.65, 0.75));
        }
        assert!(!c.is_unstable());
    }
}
