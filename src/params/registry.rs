// =============================================================================
// Parameter Registry — single writer, published snapshots
// =============================================================================
//
// Lifecycle of a tunable parameter:
//
//   static ──propose──▶ shadow ──promote──▶ rollout ──promote──▶ active
//      ▲                  │                   │                    │
//      └──────────────────┴───── rollback ────┴────────────────────┘
//
// Every mutation runs under `writer`, builds the new state on a copy,
// persists it, and only then swaps it in and publishes a fresh snapshot.
// A persistence failure leaves both the in-memory state and the published
// snapshot untouched.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::parameter::{
    AuditAction, Experiment, ExperimentStage, OutcomeSummary, Parameter, Resolution,
};
use super::{ExperimentView, ParameterSnapshot};
use crate::error::RegistryError;
use crate::persistence::{Persistence, Query};
use crate::runtime_config::{deadline_after, RuntimeConfig, ValidationConfig};
use crate::types::ParameterStatus;

struct RegistryState {
    parameters: BTreeMap<String, Parameter>,
    experiments: HashMap<String, Experiment>,
    version: u64,
}

pub struct ParameterRegistry {
    writer: Mutex<RegistryState>,
    published: ArcSwap<ParameterSnapshot>,
    parameter_store: Arc<dyn Persistence<Parameter>>,
    experiment_store: Arc<dyn Persistence<Experiment>>,
    default_profile: HashMap<String, String>,
    profiles: HashMap<String, HashMap<String, String>>,
    validation: ValidationConfig,
}

impl ParameterRegistry {
    /// Build from configured definitions merged with persisted state.
    ///
    /// Bounds, defaults and the tunable flag always come from config.  A
    /// persisted value that no longer fits the configured bounds is reset to
    /// the default.
    pub fn load(
        config: &RuntimeConfig,
        parameter_store: Arc<dyn Persistence<Parameter>>,
        experiment_store: Arc<dyn Persistence<Experiment>>,
    ) -> Result<Self> {
        config.validate()?;
        let now = Utc::now();
        let mut parameters = BTreeMap::new();
        let mut experiments = HashMap::new();

        for def in &config.parameters {
            let mut param = Parameter::from_def(def, now);
            if let Some(stored) = parameter_store.load(&def.id)? {
                param.value = stored.value;
                param.status = stored.status;
                param.confidence = stored.confidence;
                param.version = stored.version;
                param.updated_at = stored.updated_at;
                param.active_experiment = stored.active_experiment;
                param.validated_history = stored.validated_history;
                param.audit = stored.audit;
            }

            if !param.in_bounds(param.value) {
                warn!(
                    parameter = %param.id,
                    value = param.value,
                    "persisted value outside configured bounds, resetting to default"
                );
                let from = param.status;
                let before = param.value;
                param.value = param.default;
                param.status = ParameterStatus::Static;
                param.active_experiment = None;
                param.validated_history.clear();
                param.push_audit(AuditAction::Reset, from, before, None, "bounds changed", now);
            }

            if let Some(exp_id) = param.active_experiment.clone() {
                match experiment_store.load(&exp_id)? {
                    Some(exp) if exp.is_open() && exp.parameter_id == param.id => {
                        experiments.insert(exp.id.clone(), exp);
                    }
                    _ => {
                        warn!(parameter = %param.id, experiment = %exp_id, "dangling experiment reference cleared");
                        param.active_experiment = None;
                        param.status = if param.validated_history.is_empty() {
                            ParameterStatus::Static
                        } else {
                            ParameterStatus::Active
                        };
                    }
                }
            }

            parameters.insert(param.id.clone(), param);
        }

        // Closed experiments are history; open ones only count when a
        // parameter still points at them.
        for exp in experiment_store.list(&Query::all())? {
            if !exp.is_open() {
                experiments.entry(exp.id.clone()).or_insert(exp);
            }
        }

        let state = RegistryState {
            parameters,
            experiments,
            version: 1,
        };
        let snapshot = Arc::new(build_snapshot(&state));

        info!(
            parameters = state.parameters.len(),
            open_experiments = state.experiments.values().filter(|e| e.is_open()).count(),
            "parameter registry loaded"
        );

        Ok(Self {
            writer: Mutex::new(state),
            published: ArcSwap::new(snapshot),
            parameter_store,
            experiment_store,
            default_profile: config.default_profile.clone(),
            profiles: config.profiles.clone(),
            validation: config.validation.clone(),
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Lock-free: scans never wait on a writer.
    pub fn snapshot(&self) -> Arc<ParameterSnapshot> {
        self.published.load_full()
    }

    /// Production value of `parameter_id` under `regime`'s profile.
    pub fn get_active(&self, parameter_id: &str, regime: Option<&str>) -> Option<f64> {
        let resolved = self.resolve(parameter_id, regime);
        self.snapshot().value(&resolved)
    }

    /// Parameter a regime profile substitutes for `parameter_id`.
    fn resolve(&self, parameter_id: &str, regime: Option<&str>) -> String {
        let component = self
            .default_profile
            .iter()
            .find(|(_, p)| p.as_str() == parameter_id)
            .map(|(c, _)| c.as_str());
        regime
            .and_then(|r| self.profiles.get(r))
            .zip(component)
            .and_then(|(profile, c)| profile.get(c))
            .cloned()
            .unwrap_or_else(|| parameter_id.to_string())
    }

    /// One parameter, or all of them when `parameter_id` is `None`.
    pub fn status(&self, parameter_id: Option<&str>) -> Result<Vec<Parameter>, RegistryError> {
        let state = self.writer.lock();
        match parameter_id {
            Some(id) => state
                .parameters
                .get(id)
                .cloned()
                .map(|p| vec![p])
                .ok_or_else(|| RegistryError::UnknownParameter(id.to_string())),
            None => Ok(state.parameters.values().cloned().collect()),
        }
    }

    pub fn parameter(&self, parameter_id: &str) -> Option<Parameter> {
        self.writer.lock().parameters.get(parameter_id).cloned()
    }

    pub fn experiment(&self, experiment_id: &str) -> Option<Experiment> {
        self.writer.lock().experiments.get(experiment_id).cloned()
    }

    pub fn open_experiments(&self) -> Vec<Experiment> {
        let state = self.writer.lock();
        let mut open: Vec<Experiment> = state
            .experiments
            .values()
            .filter(|e| e.is_open())
            .cloned()
            .collect();
        open.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        open
    }

    /// Tunable parameters with no experiment in flight.
    pub fn tunable_idle(&self) -> Vec<Parameter> {
        self.writer
            .lock()
            .parameters
            .values()
            .filter(|p| p.tunable && p.active_experiment.is_none())
            .cloned()
            .collect()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Open a shadow experiment for `candidate`.
    pub fn propose(&self, parameter_id: &str, candidate: f64) -> Result<String, RegistryError> {
        let mut state = self.writer.lock();
        let now = Utc::now();

        let mut param = state
            .parameters
            .get(parameter_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownParameter(parameter_id.to_string()))?;
        if !param.tunable {
            return Err(RegistryError::NotTunable(parameter_id.to_string()));
        }
        if let Some(existing) = &param.active_experiment {
            return Err(RegistryError::ExperimentInFlight {
                parameter_id: parameter_id.to_string(),
                experiment_id: existing.clone(),
            });
        }
        if !param.in_bounds(candidate) {
            return Err(RegistryError::ParameterOutOfBounds {
                parameter_id: parameter_id.to_string(),
                value: candidate,
                lower: param.lower_bound,
                upper: param.upper_bound,
            });
        }

        let experiment = Experiment {
            id: Uuid::new_v4().to_string(),
            parameter_id: parameter_id.to_string(),
            candidate_value: candidate,
            baseline_value: param.value,
            traffic_fraction: 0.0,
            stage: ExperimentStage::Shadow,
            started_at: now,
            ends_at: deadline_after(now, self.validation.shadow_duration_secs),
            outcome_summary: None,
            closed_at: None,
            resolution: None,
        };

        let from = param.status;
        param.status = ParameterStatus::Shadow;
        param.active_experiment = Some(experiment.id.clone());
        param.push_audit(
            AuditAction::Proposed,
            from,
            param.value,
            Some(&experiment.id),
            format!("candidate {candidate}"),
            now,
        );

        self.persist(&param, Some(&experiment))?;
        let experiment_id = experiment.id.clone();
        info!(
            parameter = parameter_id,
            experiment = %experiment_id,
            candidate,
            baseline = experiment.baseline_value,
            "candidate entered shadow"
        );
        state.experiments.insert(experiment_id.clone(), experiment);
        state.parameters.insert(param.id.clone(), param);
        self.publish(&mut state);
        Ok(experiment_id)
    }

    /// Advance an experiment one stage: shadow → rollout → active.
    pub fn promote(&self, experiment_id: &str) -> Result<ParameterStatus, RegistryError> {
        let mut state = self.writer.lock();
        let now = Utc::now();

        let mut exp = state
            .experiments
            .get(experiment_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownExperiment(experiment_id.to_string()))?;
        let mut param = state
            .parameters
            .get(&exp.parameter_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownParameter(exp.parameter_id.clone()))?;
        if param.active_experiment.as_deref() != Some(experiment_id) {
            return Err(RegistryError::ExperimentClosed(experiment_id.to_string()));
        }

        let from = param.status;
        let before = param.value;
        match exp.stage {
            ExperimentStage::Closed => {
                return Err(RegistryError::ExperimentClosed(experiment_id.to_string()))
            }
            ExperimentStage::Shadow => {
                exp.stage = ExperimentStage::Rollout;
                exp.traffic_fraction = self.validation.rollout_fraction.clamp(0.0, 1.0);
                exp.ends_at = deadline_after(now, self.validation.rollout_duration_secs);
                param.status = ParameterStatus::Rollout;
            }
            ExperimentStage::Rollout => {
                if !param.in_bounds(exp.candidate_value) {
                    return Err(RegistryError::ParameterOutOfBounds {
                        parameter_id: param.id.clone(),
                        value: exp.candidate_value,
                        lower: param.lower_bound,
                        upper: param.upper_bound,
                    });
                }
                exp.stage = ExperimentStage::Closed;
                exp.traffic_fraction = 0.0;
                exp.closed_at = Some(now);
                exp.resolution = Some(Resolution::Promoted);
                param.validated_history.push(param.value);
                param.value = exp.candidate_value;
                param.status = ParameterStatus::Active;
                param.active_experiment = None;
            }
        }
        param.push_audit(
            AuditAction::Promoted,
            from,
            before,
            Some(experiment_id),
            format!("stage {}", exp.stage),
            now,
        );

        self.persist(&param, Some(&exp))?;
        let to = param.status;
        info!(
            parameter = %param.id,
            experiment = experiment_id,
            from = %from,
            to = %to,
            value = param.value,
            "experiment promoted"
        );
        state.experiments.insert(exp.id.clone(), exp);
        state.parameters.insert(param.id.clone(), param);
        self.publish(&mut state);
        Ok(to)
    }

    /// Abort any experiment in flight, or revert the last promotion.
    /// Returns the production value afterwards.
    pub fn rollback(&self, parameter_id: &str, note: &str) -> Result<f64, RegistryError> {
        let mut state = self.writer.lock();
        let now = Utc::now();

        let mut param = state
            .parameters
            .get(parameter_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownParameter(parameter_id.to_string()))?;
        let from = param.status;
        let before = param.value;

        let closed = match param.active_experiment.take() {
            Some(exp_id) => {
                let mut exp = state
                    .experiments
                    .get(&exp_id)
                    .cloned()
                    .ok_or_else(|| RegistryError::UnknownExperiment(exp_id.clone()))?;
                exp.stage = ExperimentStage::Closed;
                exp.traffic_fraction = 0.0;
                exp.closed_at = Some(now);
                exp.resolution = Some(Resolution::RolledBack);
                Some(exp)
            }
            None => {
                if param.status != ParameterStatus::Active {
                    return Err(RegistryError::NothingToRollBack(parameter_id.to_string()));
                }
                param.value = param.validated_history.pop().unwrap_or(param.default);
                None
            }
        };

        param.status = if param.validated_history.is_empty() {
            ParameterStatus::Static
        } else {
            ParameterStatus::Active
        };
        let exp_id = closed.as_ref().map(|e| e.id.clone());
        param.push_audit(
            AuditAction::RolledBack,
            from,
            before,
            exp_id.as_deref(),
            note,
            now,
        );

        self.persist(&param, closed.as_ref())?;
        warn!(
            parameter = parameter_id,
            experiment = exp_id.as_deref().unwrap_or("-"),
            from = %from,
            to = %param.status,
            value = param.value,
            note,
            "parameter rolled back"
        );
        let value = param.value;
        if let Some(exp) = closed {
            state.experiments.insert(exp.id.clone(), exp);
        }
        state.parameters.insert(param.id.clone(), param);
        self.publish(&mut state);
        Ok(value)
    }

    pub fn set_confidence(&self, parameter_id: &str, confidence: f64) -> Result<(), RegistryError> {
        let mut state = self.writer.lock();
        let now = Utc::now();
        let mut param = state
            .parameters
            .get(parameter_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownParameter(parameter_id.to_string()))?;
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if (param.confidence - confidence).abs() < 1e-9 {
            return Ok(());
        }
        param.confidence = confidence;
        let status = param.status;
        param.push_audit(
            AuditAction::ConfidenceSet,
            status,
            param.value,
            None,
            format!("confidence {confidence:.3}"),
            now,
        );
        self.persist(&param, None)?;
        state.parameters.insert(param.id.clone(), param);
        self.publish(&mut state);
        Ok(())
    }

    /// Attach the latest validation comparison to an open experiment.
    pub fn record_summary(
        &self,
        experiment_id: &str,
        summary: OutcomeSummary,
    ) -> Result<(), RegistryError> {
        let mut state = self.writer.lock();
        let mut exp = state
            .experiments
            .get(experiment_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownExperiment(experiment_id.to_string()))?;
        if !exp.is_open() {
            return Err(RegistryError::ExperimentClosed(experiment_id.to_string()));
        }
        exp.outcome_summary = Some(summary);
        self.experiment_store
            .save(&exp)
            .map_err(|e| RegistryError::Persistence(e.to_string()))?;
        state.experiments.insert(exp.id.clone(), exp);
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn persist(&self, param: &Parameter, exp: Option<&Experiment>) -> Result<(), RegistryError> {
        if let Some(exp) = exp {
            self.experiment_store
                .save(exp)
                .map_err(|e| RegistryError::Persistence(e.to_string()))?;
        }
        self.parameter_store
            .save(param)
            .map_err(|e| RegistryError::Persistence(e.to_string()))
    }

    fn publish(&self, state: &mut RegistryState) {
        state.version += 1;
        self.published.store(Arc::new(build_snapshot(state)));
    }
}

fn build_snapshot(state: &RegistryState) -> ParameterSnapshot {
    let mut experiments: Vec<ExperimentView> = state
        .experiments
        .values()
        .filter(|e| e.is_open())
        .map(|e| ExperimentView {
            experiment_id: e.id.clone(),
            parameter_id: e.parameter_id.clone(),
            stage: e.stage,
            candidate_value: e.candidate_value,
            traffic_fraction: e.traffic_fraction,
        })
        .collect();
    experiments.sort_by(|a, b| a.experiment_id.cmp(&b.experiment_id));

    ParameterSnapshot {
        version: state.version,
        taken_at: Utc::now(),
        values: state
            .parameters
            .values()
            .map(|p| (p.id.clone(), p.value))
            .collect(),
        experiments,
    }
}

impl std::fmt::Debug for ParameterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterRegistry")
            .field("version", &self.snapshot().version)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    struct Fixture {
        registry: ParameterRegistry,
        params: Arc<MemoryStore<Parameter>>,
        experiments: Arc<MemoryStore<Experiment>>,
    }

    fn fixture() -> Fixture {
        let params = Arc::new(MemoryStore::new());
        let experiments = Arc::new(MemoryStore::new());
        let registry = ParameterRegistry::load(
            &RuntimeConfig::default(),
            params.clone(),
            experiments.clone(),
        )
        .unwrap();
        Fixture {
            registry,
            params,
            experiments,
        }
    }

    fn assert_all_in_bounds(registry: &ParameterRegistry) {
        for p in registry.status(None).unwrap() {
            assert!(p.in_bounds(p.value), "{} = {} out of bounds", p.id, p.value);
        }
    }

    #[test]
    fn out_of_bounds_rejected_in_bounds_enters_shadow() {
        let fx = fixture();
        let err = fx.registry.propose("theme_heat_weight", 1.3).unwrap_err();
        assert!(matches!(err, RegistryError::ParameterOutOfBounds { .. }));
        assert_eq!(
            fx.registry.parameter("theme_heat_weight").unwrap().status,
            ParameterStatus::Static
        );

        let exp_id = fx.registry.propose("theme_heat_weight", 0.25).unwrap();
        let exp = fx.registry.experiment(&exp_id).unwrap();
        assert_eq!(exp.stage, ExperimentStage::Shadow);
        assert_eq!(exp.candidate_value, 0.25);
        let p = fx.registry.parameter("theme_heat_weight").unwrap();
        assert_eq!(p.status, ParameterStatus::Shadow);
        assert!((p.value - 0.18).abs() < 1e-12);
        assert_all_in_bounds(&fx.registry);
    }

    #[test]
    fn one_experiment_per_parameter() {
        let fx = fixture();
        fx.registry.propose("price_weight", 0.4).unwrap();
        let err = fx.registry.propose("price_weight", 0.5).unwrap_err();
        assert!(matches!(err, RegistryError::ExperimentInFlight { .. }));
        fx.registry.propose("volume_weight", 0.2).unwrap();
        assert_eq!(fx.registry.open_experiments().len(), 2);
    }

    #[test]
    fn full_promotion_then_rollback_restores_previous() {
        let fx = fixture();
        let exp_id = fx.registry.propose("catalyst_weight", 0.35).unwrap();
        assert_eq!(fx.registry.promote(&exp_id).unwrap(), ParameterStatus::Rollout);
        let snap = fx.registry.snapshot();
        let view = snap.experiment(&exp_id).unwrap();
        assert_eq!(view.stage, ExperimentStage::Rollout);
        assert!(view.traffic_fraction > 0.0);
        assert_eq!(snap.value("catalyst_weight"), Some(0.20));

        assert_eq!(fx.registry.promote(&exp_id).unwrap(), ParameterStatus::Active);
        assert_eq!(fx.registry.get_active("catalyst_weight", None), Some(0.35));
        assert!(fx.registry.snapshot().experiment(&exp_id).is_none());
        assert!(matches!(
            fx.registry.promote(&exp_id),
            Err(RegistryError::ExperimentClosed(_))
        ));

        let restored = fx.registry.rollback("catalyst_weight", "manual").unwrap();
        assert!((restored - 0.20).abs() < 1e-12);
        let p = fx.registry.parameter("catalyst_weight").unwrap();
        assert_eq!(p.status, ParameterStatus::Static);
        assert!(matches!(
            fx.registry.rollback("catalyst_weight", "again"),
            Err(RegistryError::NothingToRollBack(_))
        ));
        assert_all_in_bounds(&fx.registry);
    }

    #[test]
    fn rollback_during_rollout_keeps_last_validated_value() {
        let fx = fixture();
        let first = fx.registry.propose("price_weight", 0.4).unwrap();
        fx.registry.promote(&first).unwrap();
        fx.registry.promote(&first).unwrap();

        let second = fx.registry.propose("price_weight", 0.6).unwrap();
        fx.registry.promote(&second).unwrap();
        let value = fx.registry.rollback("price_weight", "underperformed").unwrap();
        assert!((value - 0.4).abs() < 1e-12);
        let p = fx.registry.parameter("price_weight").unwrap();
        assert_eq!(p.status, ParameterStatus::Active);
        assert!(p.active_experiment.is_none());
        assert_eq!(
            fx.registry.experiment(&second).unwrap().resolution,
            Some(Resolution::RolledBack)
        );
    }

    #[test]
    fn snapshot_versions_are_monotonic() {
        let fx = fixture();
        let v0 = fx.registry.snapshot().version;
        let exp = fx.registry.propose("price_weight", 0.4).unwrap();
        let v1 = fx.registry.snapshot().version;
        fx.registry.promote(&exp).unwrap();
        let v2 = fx.registry.snapshot().version;
        assert!(v0 < v1 && v1 < v2);
    }

    #[test]
    fn snapshot_reads_do_not_wait_for_writer() {
        let fx = fixture();
        let held = fx.registry.snapshot();
        let _writer = fx.registry.writer.lock();
        // Reads complete while a mutation holds the writer guard.
        assert_eq!(fx.registry.snapshot().version, held.version);
        assert_eq!(fx.registry.get_active("price_weight", None), Some(0.30));
    }

    #[test]
    fn held_snapshot_is_unaffected_by_publish() {
        let fx = fixture();
        let before = fx.registry.snapshot();
        let exp = fx.registry.propose("price_weight", 0.4).unwrap();
        fx.registry.promote(&exp).unwrap();
        fx.registry.promote(&exp).unwrap();
        assert_eq!(before.value("price_weight"), Some(0.30));
        assert!(before.experiments.is_empty());
        assert_eq!(fx.registry.get_active("price_weight", None), Some(0.4));
    }

    #[test]
    fn persistence_failure_changes_nothing() {
        let fx = fixture();
        let before = fx.registry.snapshot();
        fx.params.set_fail_writes(true);
        let err = fx.registry.propose("price_weight", 0.4).unwrap_err();
        assert!(matches!(err, RegistryError::Persistence(_)));
        assert_eq!(fx.registry.snapshot().version, before.version);
        assert_eq!(
            fx.registry.parameter("price_weight").unwrap().status,
            ParameterStatus::Static
        );
        assert!(fx.registry.open_experiments().is_empty());
    }

    #[test]
    fn regime_profile_substitutes_parameter() {
        let fx = fixture();
        assert_eq!(fx.registry.get_active("price_weight", None), Some(0.30));
        assert_eq!(
            fx.registry.get_active("price_weight", Some("volatile")),
            Some(0.20)
        );
        assert_eq!(
            fx.registry.get_active("price_weight", Some("trending")),
            Some(0.30)
        );
    }

    #[test]
    fn state_survives_reload() {
        let fx = fixture();
        let exp = fx.registry.propose("volume_weight", 0.3).unwrap();
        fx.registry.promote(&exp).unwrap();
        fx.registry.set_confidence("volume_weight", 0.7).unwrap();

        let reloaded = ParameterRegistry::load(
            &RuntimeConfig::default(),
            fx.params.clone(),
            fx.experiments.clone(),
        )
        .unwrap();
        let p = reloaded.parameter("volume_weight").unwrap();
        assert_eq!(p.status, ParameterStatus::Rollout);
        assert!((p.confidence - 0.7).abs() < 1e-12);
        assert_eq!(reloaded.open_experiments().len(), 1);
        assert!(!p.audit.is_empty());
    }

    #[test]
    fn load_rejects_profile_with_undefined_parameter() {
        let mut cfg = RuntimeConfig::default();
        cfg.default_profile
            .insert("price".into(), "momentum_weight".into());
        let err = ParameterRegistry::load(
            &cfg,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("momentum_weight"));
    }

    #[test]
    fn huge_experiment_durations_saturate() {
        let mut cfg = RuntimeConfig::default();
        cfg.validation.shadow_duration_secs = u64::MAX;
        cfg.validation.rollout_duration_secs = u64::MAX;
        let registry = ParameterRegistry::load(
            &cfg,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        let exp = registry.propose("price_weight", 0.4).unwrap();
        registry.promote(&exp).unwrap();
        assert_eq!(
            registry.experiment(&exp).unwrap().ends_at,
            chrono::DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn unknown_ids_are_errors() {
        let fx = fixture();
        assert!(matches!(
            fx.registry.propose("nope", 0.1),
            Err(RegistryError::UnknownParameter(_))
        ));
        assert!(matches!(
            fx.registry.promote("nope"),
            Err(RegistryError::UnknownExperiment(_))
        ));
        assert!(fx.registry.status(Some("nope")).is_err());
        assert_eq!(fx.registry.status(None).unwrap().len(), 8);
    }
}
