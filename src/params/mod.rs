// =============================================================================
// Parameters — versioned tunable weights and thresholds
// =============================================================================
//
// Readers never lock the registry: a scan grabs one `Arc<ParameterSnapshot>`
// and scores the whole batch against it.  Writers go through the registry's
// single mutex, persist, and only then publish a new snapshot.
// =============================================================================

pub mod parameter;
pub mod registry;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use parameter::{
    AuditAction, AuditEntry, Experiment, ExperimentStage, OutcomeSummary, Parameter, Resolution,
};
pub use registry::ParameterRegistry;

/// Which arm of the experiments a decision was scored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Variant {
    /// Production values only.
    LiveBaseline,
    /// Production values with these rollout candidates applied.
    LiveCandidate { experiments: Vec<String> },
    /// Never emitted; production values plus one shadow candidate.
    Shadow { experiment_id: String },
}

impl Variant {
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Shadow { .. })
    }

    pub fn is_candidate_for(&self, experiment_id: &str) -> bool {
        match self {
            Self::LiveCandidate { experiments } => experiments.iter().any(|e| e == experiment_id),
            Self::Shadow { experiment_id: e } => e == experiment_id,
            Self::LiveBaseline => false,
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LiveBaseline => write!(f, "baseline"),
            Self::LiveCandidate { experiments } => write!(f, "candidate({})", experiments.join(",")),
            Self::Shadow { experiment_id } => write!(f, "shadow({experiment_id})"),
        }
    }
}

/// Read-only view of an open experiment inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentView {
    pub experiment_id: String,
    pub parameter_id: String,
    pub stage: ExperimentStage,
    pub candidate_value: f64,
    pub traffic_fraction: f64,
}

/// Immutable, versioned view of every parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    pub version: u64,
    pub taken_at: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
    #[serde(default)]
    pub experiments: Vec<ExperimentView>,
}

impl ParameterSnapshot {
    pub fn value(&self, parameter_id: &str) -> Option<f64> {
        self.values.get(parameter_id).copied()
    }

    pub fn experiment(&self, experiment_id: &str) -> Option<&ExperimentView> {
        self.experiments
            .iter()
            .find(|e| e.experiment_id == experiment_id)
    }

    pub fn experiments_in(&self, stage: ExperimentStage) -> impl Iterator<Item = &ExperimentView> {
        self.experiments.iter().filter(move |e| e.stage == stage)
    }

    /// Copy with the candidates of `experiment_ids` written over production
    /// values.  Unknown ids are ignored.
    pub fn with_candidates<'a>(&self, experiment_ids: impl IntoIterator<Item = &'a str>) -> Self {
        let mut out = self.clone();
        for id in experiment_ids {
            if let Some(exp) = self.experiment(id) {
                out.values.insert(exp.parameter_id.clone(), exp.candidate_value);
            }
        }
        out
    }
}
