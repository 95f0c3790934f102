// =============================================================================
// Regime features — cross-sectional summary of one scan's price signals
// =============================================================================
//
//   trend       |mean(x)|      broad directional agreement
//   volatility  mean(|x|)      size of moves regardless of direction
//   dispersion  stddev(x)      how much instruments disagree
//
// `x` are the normalized price signals, each in [-1, 1].
// =============================================================================

use serde::{Deserialize, Serialize};

pub const FEATURE_DIM: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub trend: f64,
    pub volatility: f64,
    pub dispersion: f64,
}

impl FeatureVector {
    /// `None` when there is nothing to summarise.
    pub fn from_signals(signals: &[f64]) -> Option<Self> {
        let xs: Vec<f64> = signals.iter().copied().filter(|x| x.is_finite()).collect();
        if xs.is_empty() {
            return None;
        }
        let n = xs.len() as f64;
        let mean = xs.iter().sum::<f64>() / n;
        let volatility = xs.iter().map(|x| x.abs()).sum::<f64>() / n;
        let variance = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            trend: mean.abs(),
            volatility,
            dispersion: variance.sqrt(),
        })
    }

    pub fn as_array(&self) -> [f64; FEATURE_DIM] {
        [self.trend, self.volatility, self.dispersion]
    }
}
