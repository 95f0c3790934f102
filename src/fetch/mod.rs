// =============================================================================
// Fetch — per-instrument partial results
// =============================================================================

pub mod orchestrator;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::providers::SignalReading;
use crate::types::{DataType, MissingReason};

pub use orchestrator::FetchOrchestrator;

/// Everything gathered for one instrument; a data type is in exactly one map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub readings: HashMap<DataType, SignalReading>,
    pub missing: HashMap<DataType, MissingReason>,
}

impl PartialResult {
    pub fn value(&self, data_type: &str) -> Option<f64> {
        self.readings.get(data_type).map(|r| r.value)
    }

    pub fn is_missing(&self, data_type: &str) -> bool {
        self.missing.contains_key(data_type)
    }

    pub(crate) fn record(&mut self, data_type: DataType, outcome: Result<SignalReading, MissingReason>) {
        match outcome {
            Ok(reading) => {
                self.missing.remove(&data_type);
                self.readings.insert(data_type, reading);
            }
            Err(reason) => {
                self.readings.remove(&data_type);
                self.missing.insert(data_type, reason);
            }
        }
    }
}
