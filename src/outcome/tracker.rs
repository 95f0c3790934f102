// =============================================================================
// Outcome Tracker — append-only decision log
// =============================================================================
//
// Records are only ever appended, and each gains at most one realized value
// per configured horizon.  Every change is persisted before it becomes
// visible in memory.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{DecisionContext, OutcomeRecord};
use crate::error::OutcomeError;
use crate::params::ParameterSnapshot;
use crate::persistence::{Persistence, Query};
use crate::runtime_config::{HorizonDef, OutcomeConfig};

#[derive(Default)]
struct Log {
    records: Vec<OutcomeRecord>,
    index: HashMap<String, usize>,
}

impl Log {
    fn push(&mut self, record: OutcomeRecord) {
        self.index
            .insert(record.decision_id.clone(), self.records.len());
        self.records.push(record);
    }
}

pub struct OutcomeTracker {
    log: RwLock<Log>,
    store: Arc<dyn Persistence<OutcomeRecord>>,
    horizons: Vec<HorizonDef>,
}

impl OutcomeTracker {
    /// Reload every persisted record, oldest first.
    pub fn load(config: &OutcomeConfig, store: Arc<dyn Persistence<OutcomeRecord>>) -> Result<Self> {
        let mut records = store.list(&Query::all())?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut log = Log::default();
        for record in records {
            log.push(record);
        }
        info!(records = log.records.len(), "outcome tracker loaded");

        Ok(Self {
            log: RwLock::new(log),
            store,
            horizons: config.horizons.clone(),
        })
    }

    pub fn horizons(&self) -> &[HorizonDef] {
        &self.horizons
    }

    fn horizon(&self, label: &str) -> Result<&HorizonDef, OutcomeError> {
        self.horizons
            .iter()
            .find(|h| h.label == label)
            .ok_or_else(|| OutcomeError::UnknownHorizon(label.to_string()))
    }

    pub fn record_decision(
        &self,
        instrument_id: &str,
        parameter_snapshot: ParameterSnapshot,
        predicted_score: f64,
        context: DecisionContext,
    ) -> Result<String, OutcomeError> {
        let record = OutcomeRecord {
            decision_id: Uuid::new_v4().to_string(),
            instrument_id: instrument_id.to_string(),
            scan_id: context.scan_id,
            regime: context.regime,
            variant: context.variant,
            parameter_snapshot,
            predicted_score,
            horizon_results: Default::default(),
            created_at: context.decided_at,
        };
        self.store
            .save(&record)
            .map_err(|e| OutcomeError::Persistence(e.to_string()))?;

        let decision_id = record.decision_id.clone();
        debug!(
            decision = %decision_id,
            instrument = instrument_id,
            variant = %record.variant,
            score = predicted_score,
            "decision recorded"
        );
        self.log.write().push(record);
        Ok(decision_id)
    }

    pub fn attach_outcome(
        &self,
        decision_id: &str,
        horizon: &str,
        realized_value: f64,
    ) -> Result<(), OutcomeError> {
        self.horizon(horizon)?;

        let mut log = self.log.write();
        let idx = *log
            .index
            .get(decision_id)
            .ok_or_else(|| OutcomeError::UnknownDecision(decision_id.to_string()))?;
        if log.records[idx].horizon_results.contains_key(horizon) {
            return Err(OutcomeError::HorizonAlreadyAttached {
                decision_id: decision_id.to_string(),
                horizon: horizon.to_string(),
            });
        }

        let mut updated = log.records[idx].clone();
        updated
            .horizon_results
            .insert(horizon.to_string(), realized_value);
        self.store
            .save(&updated)
            .map_err(|e| OutcomeError::Persistence(e.to_string()))?;
        log.records[idx] = updated;
        Ok(())
    }

    /// Decisions whose `horizon` has elapsed by `now` but has no result yet.
    pub fn due_for(
        &self,
        horizon: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutcomeRecord>, OutcomeError> {
        let def = self.horizon(horizon)?;
        Ok(self
            .log
            .read()
            .records
            .iter()
            .filter(|r| {
                !r.horizon_results.contains_key(horizon)
                    && def.due_at(r.created_at).is_some_and(|due| due <= now)
            })
            .cloned()
            .collect())
    }

    /// Every record with a result at `horizon`, oldest first.
    pub fn resolved(&self, horizon: &str) -> Vec<OutcomeRecord> {
        self.log
            .read()
            .records
            .iter()
            .filter(|r| r.horizon_results.contains_key(horizon))
            .cloned()
            .collect()
    }

    pub fn get(&self, decision_id: &str) -> Option<OutcomeRecord> {
        let log = self.log.read();
        log.index.get(decision_id).map(|&i| log.records[i].clone())
    }

    pub fn len(&self) -> usize {
        self.log.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
