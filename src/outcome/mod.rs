// =============================================================================
// Outcomes — decisions and what later happened to them
// =============================================================================

pub mod resolver;
pub mod tracker;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::params::{ParameterSnapshot, Variant};
use crate::persistence::Entity;
use crate::types::InstrumentId;

pub use resolver::OutcomeResolver;
pub use tracker::OutcomeTracker;

/// Where a decision came from, beyond the instrument and score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub scan_id: String,
    pub regime: Option<String>,
    pub variant: Variant,
    /// Shared by every decision of one scan batch.
    pub decided_at: DateTime<Utc>,
}

/// One scored decision plus the realized values attached at each horizon.
///
/// `parameter_snapshot` holds the values actually used to score it, with
/// any candidate already applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub decision_id: String,
    pub instrument_id: InstrumentId,
    pub scan_id: String,
    #[serde(default)]
    pub regime: Option<String>,
    pub variant: Variant,
    pub parameter_snapshot: ParameterSnapshot,
    pub predicted_score: f64,
    #[serde(default)]
    pub horizon_results: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
}

impl OutcomeRecord {
    pub fn result(&self, horizon: &str) -> Option<f64> {
        self.horizon_results.get(horizon).copied()
    }

    /// Value of `parameter_id` this decision was scored with.
    pub fn parameter_value(&self, parameter_id: &str) -> Option<f64> {
        self.parameter_snapshot.value(parameter_id)
    }
}

impl Entity for OutcomeRecord {
    const KIND: &'static str = "outcomes";

    fn entity_id(&self) -> String {
        self.decision_id.clone()
    }

    fn group_key(&self) -> Option<String> {
        Some(self.instrument_id.clone())
    }
}
