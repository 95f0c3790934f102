// =============================================================================
// Parameter & Experiment records
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persistence::Entity;
use crate::runtime_config::ParameterDef;
use crate::types::ParameterStatus;

/// What happened to a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Proposed,
    Promoted,
    RolledBack,
    ConfidenceSet,
    Reset,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proposed => write!(f, "proposed"),
            Self::Promoted => write!(f, "promoted"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::ConfidenceSet => write!(f, "confidence_set"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub action: AuditAction,
    pub from: ParameterStatus,
    pub to: ParameterStatus,
    pub value_before: f64,
    pub value_after: f64,
    #[serde(default)]
    pub experiment_id: Option<String>,
    #[serde(default)]
    pub note: String,
}

/// A tunable weight or threshold.
///
/// `value` is always the production value: candidates under evaluation live
/// on the experiment and only replace `value` on final promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub id: String,
    pub category: String,
    pub value: f64,
    pub default: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub status: ParameterStatus,
    pub confidence: f64,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_tunable")]
    pub tunable: bool,
    #[serde(default)]
    pub active_experiment: Option<String>,
    /// Production values displaced by promotions, most recent last.
    #[serde(default)]
    pub validated_history: Vec<f64>,
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
}

fn default_tunable() -> bool {
    true
}

impl Parameter {
    pub fn from_def(def: &ParameterDef, now: DateTime<Utc>) -> Self {
        Self {
            id: def.id.clone(),
            category: def.category.clone(),
            value: def.default,
            default: def.default,
            lower_bound: def.lower_bound,
            upper_bound: def.upper_bound,
            status: ParameterStatus::Static,
            confidence: 0.0,
            version: 1,
            updated_at: now,
            tunable: def.tunable,
            active_experiment: None,
            validated_history: Vec::new(),
            audit: Vec::new(),
        }
    }

    /// NaN is never in bounds.
    pub fn in_bounds(&self, value: f64) -> bool {
        value >= self.lower_bound && value <= self.upper_bound
    }

    pub(crate) fn push_audit(
        &mut self,
        action: AuditAction,
        from: ParameterStatus,
        value_before: f64,
        experiment_id: Option<&str>,
        note: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.audit.push(AuditEntry {
            at: now,
            action,
            from,
            to: self.status,
            value_before,
            value_after: self.value,
            experiment_id: experiment_id.map(str::to_string),
            note: note.into(),
        });
        self.version += 1;
        self.updated_at = now;
    }
}

impl Entity for Parameter {
    const KIND: &'static str = "parameters";

    fn entity_id(&self) -> String {
        self.id.clone()
    }

    fn group_key(&self) -> Option<String> {
        Some(self.category.clone())
    }
}

// =============================================================================
// Experiments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStage {
    Shadow,
    Rollout,
    Closed,
}

impl std::fmt::Display for ExperimentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shadow => write!(f, "shadow"),
            Self::Rollout => write!(f, "rollout"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Promoted,
    RolledBack,
}

/// Latest comparison of candidate against baseline outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub baseline_n: usize,
    pub baseline_mean: f64,
    pub candidate_n: usize,
    pub candidate_mean: f64,
    pub diff: f64,
    pub stderr: f64,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub parameter_id: String,
    pub candidate_value: f64,
    /// Production value when the experiment started.
    pub baseline_value: f64,
    pub traffic_fraction: f64,
    pub stage: ExperimentStage,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub outcome_summary: Option<OutcomeSummary>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl Experiment {
    pub fn is_open(&self) -> bool {
        self.stage != ExperimentStage::Closed
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.ends_at
    }
}

impl Entity for Experiment {
    const KIND: &'static str = "experiments";

    fn entity_id(&self) -> String {
        self.id.clone()
    }

    fn group_key(&self) -> Option<String> {
        Some(self.parameter_id.clone())
    }
}
