// =============================================================================
// Weighted Composite Scorer — regime-aware signal aggregation
// =============================================================================
//
// composite = Σ weight(component, regime) · normalize(raw)
//
// Weights come from the parameter snapshot; the regime only selects which
// parameter id weights each component.  A missing optional component
// contributes a neutral 0 and is flagged; a missing required component
// makes the instrument unscoreable.
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::fetch::PartialResult;
use crate::params::ParameterSnapshot;
use crate::runtime_config::RuntimeConfig;
use crate::types::{DataType, MissingReason};

/// Direction implied by the composite relative to the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// The contribution of a single component to the composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub data_type: DataType,
    pub parameter_id: String,
    pub weight: f64,
    /// Normalized signal in [-1, 1]; 0 when missing.
    pub signal: f64,
    pub contribution: f64,
    /// Set when the component was absent and weighted neutral.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<MissingReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    pub score: f64,
    pub decision: Decision,
    pub contributions: Vec<Contribution>,
}

/// Outcome of scoring one instrument's partial result.
#[derive(Debug, Clone, PartialEq)]
pub enum Scored {
    /// Every component present.
    Complete(ScoringResult),
    /// Optional components missing and weighted neutral.
    Degraded(ScoringResult),
    /// Required components missing; not scored.
    Unscoreable(Vec<DataType>),
}

pub struct WeightedScorer {
    config: Arc<RuntimeConfig>,
}

impl WeightedScorer {
    pub fn new(config: Arc<RuntimeConfig>) -> Self {
        Self { config }
    }

    /// Parameter ids that take part in scoring under `regime`.
    pub fn parameters_in_use(&self, regime: Option<&str>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .config
            .data_types
            .iter()
            .map(|dt| self.config.weight_parameter(&dt.name, regime))
            .collect();
        ids.push(self.config.threshold_parameter.clone());
        ids
    }

    /// Normalized value of `data_type`, if present.
    pub fn signal(&self, partial: &PartialResult, data_type: &str) -> Option<f64> {
        let dt = self.config.data_type(data_type)?;
        partial.value(data_type).map(|raw| dt.normalization.normalize(raw))
    }

    pub fn score(
        &self,
        partial: &PartialResult,
        values: &ParameterSnapshot,
        regime: Option<&str>,
    ) -> Scored {
        let missing_required: Vec<DataType> = self
            .config
            .data_types
            .iter()
            .filter(|dt| dt.required && partial.value(&dt.name).is_none())
            .map(|dt| dt.name.clone())
            .collect();
        if !missing_required.is_empty() {
            return Scored::Unscoreable(missing_required);
        }

        let mut contributions = Vec::with_capacity(self.config.data_types.len());
        let mut total = 0.0;
        let mut degraded = false;

        for dt in &self.config.data_types {
            let parameter_id = self.config.weight_parameter(&dt.name, regime);
            let weight = values.value(&parameter_id).unwrap_or(0.0);
            let (signal, missing) = match partial.value(&dt.name) {
                Some(raw) => (dt.normalization.normalize(raw), None),
                None => {
                    degraded = true;
                    let reason = partial
                        .missing
                        .get(&dt.name)
                        .copied()
                        .unwrap_or(MissingReason::NotFound);
                    (0.0, Some(reason))
                }
            };
            let contribution = weight * signal;
            total += contribution;
            contributions.push(Contribution {
                data_type: dt.name.clone(),
                parameter_id,
                weight,
                signal,
                contribution,
                missing,
            });
        }

        let threshold = values
            .value(&self.config.threshold_parameter)
            .unwrap_or(0.0);
        let decision = if total > threshold {
            Decision::Bullish
        } else if total < -threshold {
            Decision::Bearish
        } else {
            Decision::Neutral
        };

        let result = ScoringResult {
            score: total,
            decision,
            contributions,
        };
        if degraded {
            Scored::Degraded(result)
        } else {
            Scored::Complete(result)
        }
    }
}
