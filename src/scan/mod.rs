// =============================================================================
// Scan — batch scoring of an instrument universe
// =============================================================================

pub mod coordinator;
pub mod scoring;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::params::Variant;
use crate::types::{DataType, InstrumentId, InstrumentStatus, MissingReason};

pub use coordinator::ScanCoordinator;
pub use scoring::{Contribution, Decision, WeightedScorer};

/// Final state of one instrument in one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentResult {
    pub scan_id: String,
    pub instrument_id: InstrumentId,
    pub status: InstrumentStatus,
    pub composite_score: Option<f64>,
    pub decision: Option<Decision>,
    /// 1-based; only scored and degraded instruments are ranked.
    pub rank: Option<usize>,
    pub contributions: Vec<Contribution>,
    pub missing: BTreeMap<DataType, MissingReason>,
    pub regime: Option<String>,
    pub variant: Variant,
    pub decision_id: Option<String>,
    pub parameter_version: u64,
}

impl InstrumentResult {
    pub(crate) fn pending(scan_id: &str, instrument_id: &str, parameter_version: u64) -> Self {
        Self {
            scan_id: scan_id.to_string(),
            instrument_id: instrument_id.to_string(),
            status: InstrumentStatus::Pending,
            composite_score: None,
            decision: None,
            rank: None,
            contributions: Vec::new(),
            missing: BTreeMap::new(),
            regime: None,
            variant: Variant::LiveBaseline,
            decision_id: None,
            parameter_version,
        }
    }

    /// Move along the status state machine; illegal edges are refused.
    pub(crate) fn advance(&mut self, next: InstrumentStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            tracing::warn!(
                instrument = %self.instrument_id,
                from = %self.status,
                to = %next,
                "illegal instrument status transition"
            );
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub scan_id: String,
    pub requested: usize,
    pub scored: usize,
    pub degraded: usize,
    pub failed: usize,
    pub regime: Option<String>,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// A scan as kept in history and served by `get_scan_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanBatch {
    pub scan_id: String,
    pub status: ScanStatus,
    pub instrument_ids: Vec<InstrumentId>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Ranked results first, then failures, each in instrument order.
    pub results: Vec<InstrumentResult>,
    pub summary: Option<BatchSummary>,
}
