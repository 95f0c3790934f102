// =============================================================================
// Validation Engine — moves experiments through shadow → rollout → active
// =============================================================================
//
// Fail-closed: anything short of a clear verdict holds the experiment where
// it is, and the production value never moves on a hold.  Registry errors
// are holds too.  An experiment that reaches `ends_at` without a verdict is
// rolled back.
//
// Samples per stage:
//
//   shadow   each shadow record paired with the live record of the same
//            instrument and scan; candidate = shadow reward, baseline = live
//   rollout  live records scored while the experiment was in rollout;
//            candidate arm vs the rest
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::stats::{decide, welch, Comparison, Verdict};
use crate::error::ValidationInconclusive;
use crate::outcome::{OutcomeRecord, OutcomeTracker};
use crate::params::{Experiment, ExperimentStage, OutcomeSummary, ParameterRegistry, Variant};
use crate::regime::RegimeClassifier;
use crate::runtime_config::{RewardMode, ValidationConfig};
use crate::types::ParameterStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Promoted {
        experiment_id: String,
        parameter_id: String,
        to: ParameterStatus,
    },
    RolledBack {
        experiment_id: String,
        parameter_id: String,
        candidate_value: f64,
        restored_value: f64,
    },
    Held {
        experiment_id: String,
        reason: ValidationInconclusive,
    },
}

impl ValidationOutcome {
    pub fn experiment_id(&self) -> &str {
        match self {
            Self::Promoted { experiment_id, .. }
            | Self::RolledBack { experiment_id, .. }
            | Self::Held { experiment_id, .. } => experiment_id,
        }
    }
}

pub struct ValidationEngine {
    config: ValidationConfig,
    reward_mode: RewardMode,
    registry: Arc<ParameterRegistry>,
    tracker: Arc<OutcomeTracker>,
    regime: Arc<RegimeClassifier>,
}

impl ValidationEngine {
    pub fn new(
        config: ValidationConfig,
        reward_mode: RewardMode,
        registry: Arc<ParameterRegistry>,
        tracker: Arc<OutcomeTracker>,
        regime: Arc<RegimeClassifier>,
    ) -> Self {
        Self {
            config,
            reward_mode,
            registry,
            tracker,
            regime,
        }
    }

    /// Evaluate every open experiment, oldest first.
    pub fn evaluate_all(&self, now: DateTime<Utc>) -> Vec<ValidationOutcome> {
        let records = self.tracker.resolved(&self.config.horizon);
        self.registry
            .open_experiments()
            .iter()
            .map(|exp| self.evaluate_with(exp, &records, now))
            .collect()
    }

    pub fn evaluate(&self, experiment_id: &str, now: DateTime<Utc>) -> ValidationOutcome {
        let Some(exp) = self.registry.experiment(experiment_id) else {
            return ValidationOutcome::Held {
                experiment_id: experiment_id.to_string(),
                reason: ValidationInconclusive::Registry(format!(
                    "unknown experiment '{experiment_id}'"
                )),
            };
        };
        let records = self.tracker.resolved(&self.config.horizon);
        self.evaluate_with(&exp, &records, now)
    }

    fn evaluate_with(
        &self,
        exp: &Experiment,
        records: &[OutcomeRecord],
        now: DateTime<Utc>,
    ) -> ValidationOutcome {
        if !exp.is_open() {
            return self.held(exp, ValidationInconclusive::Registry("experiment closed".into()));
        }

        let (baseline, candidate) = match exp.stage {
            ExperimentStage::Shadow => self.shadow_samples(&exp.id, records),
            _ => self.rollout_samples(&exp.id, records),
        };
        let cmp = welch(&baseline, &candidate);
        self.record_summary(exp, &cmp);

        let required = self.config.min_samples;
        let reason = if baseline.len() < required || candidate.len() < required {
            ValidationInconclusive::InsufficientSamples {
                baseline: baseline.len(),
                candidate: candidate.len(),
                required,
            }
        } else if self.regime.is_unstable() {
            ValidationInconclusive::RegimeUnstable
        } else {
            match decide(&cmp, self.config.z, self.config.margin) {
                Verdict::Rollback => {
                    return self.rollback(
                        exp,
                        &format!(
                            "candidate worse than baseline: diff {:.5} stderr {:.5}",
                            cmp.diff, cmp.stderr
                        ),
                    )
                }
                Verdict::Promote => return self.promote(exp, &cmp),
                Verdict::Hold => ValidationInconclusive::WithinUncertainty {
                    diff: cmp.diff,
                    stderr: cmp.stderr,
                },
            }
        };

        if exp.is_expired(now) {
            return self.rollback(exp, &format!("expired without verdict ({reason})"));
        }
        debug!(experiment = %exp.id, stage = %exp.stage, reason = %reason, "experiment held");
        self.held(exp, reason)
    }

    fn reward(&self, record: &OutcomeRecord) -> Option<f64> {
        record
            .result(&self.config.horizon)
            .map(|r| self.reward_mode.reward(record.predicted_score, r))
    }

    fn shadow_samples(&self, experiment_id: &str, records: &[OutcomeRecord]) -> (Vec<f64>, Vec<f64>) {
        let live: HashMap<(&str, &str), &OutcomeRecord> = records
            .iter()
            .filter(|r| r.variant.is_live())
            .map(|r| ((r.instrument_id.as_str(), r.scan_id.as_str()), r))
            .collect();

        let mut baseline = Vec::new();
        let mut candidate = Vec::new();
        for shadow in records.iter().filter(|r| {
            matches!(&r.variant, Variant::Shadow { experiment_id: e } if e == experiment_id)
        }) {
            let Some(paired) = live.get(&(shadow.instrument_id.as_str(), shadow.scan_id.as_str()))
            else {
                continue;
            };
            if let (Some(b), Some(c)) = (self.reward(paired), self.reward(shadow)) {
                baseline.push(b);
                candidate.push(c);
            }
        }
        (baseline, candidate)
    }

    fn rollout_samples(&self, experiment_id: &str, records: &[OutcomeRecord]) -> (Vec<f64>, Vec<f64>) {
        let mut baseline = Vec::new();
        let mut candidate = Vec::new();
        for record in records.iter().filter(|r| {
            r.variant.is_live()
                && r.parameter_snapshot
                    .experiment(experiment_id)
                    .is_some_and(|e| e.stage == ExperimentStage::Rollout)
        }) {
            let Some(reward) = self.reward(record) else {
                continue;
            };
            if record.variant.is_candidate_for(experiment_id) {
                candidate.push(reward);
            } else {
                baseline.push(reward);
            }
        }
        (baseline, candidate)
    }

    fn record_summary(&self, exp: &Experiment, cmp: &Comparison) {
        let summary = OutcomeSummary {
            baseline_n: cmp.baseline.n,
            baseline_mean: cmp.baseline.mean,
            candidate_n: cmp.candidate.n,
            candidate_mean: cmp.candidate.mean,
            diff: cmp.diff,
            stderr: cmp.stderr,
            note: format!("stage {}", exp.stage),
        };
        if let Err(e) = self.registry.record_summary(&exp.id, summary) {
            warn!(experiment = %exp.id, error = %e, "failed to record outcome summary");
        }
    }

    fn promote(&self, exp: &Experiment, cmp: &Comparison) -> ValidationOutcome {
        match self.registry.promote(&exp.id) {
            Ok(to) => {
                info!(
                    experiment = %exp.id,
                    parameter = %exp.parameter_id,
                    to = %to,
                    diff = format!("{:.5}", cmp.diff),
                    stderr = format!("{:.5}", cmp.stderr),
                    "candidate passed validation"
                );
                ValidationOutcome::Promoted {
                    experiment_id: exp.id.clone(),
                    parameter_id: exp.parameter_id.clone(),
                    to,
                }
            }
            Err(e) => self.held(exp, ValidationInconclusive::Registry(e.to_string())),
        }
    }

    fn rollback(&self, exp: &Experiment, note: &str) -> ValidationOutcome {
        match self.registry.rollback(&exp.parameter_id, note) {
            Ok(restored_value) => ValidationOutcome::RolledBack {
                experiment_id: exp.id.clone(),
                parameter_id: exp.parameter_id.clone(),
                candidate_value: exp.candidate_value,
                restored_value,
            },
            Err(e) => self.held(exp, ValidationInconclusive::Registry(e.to_string())),
        }
    }

    fn held(&self, exp: &Experiment, reason: ValidationInconclusive) -> ValidationOutcome {
        ValidationOutcome::Held {
            experiment_id: exp.id.clone(),
            reason,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::DecisionContext;
    use crate::persistence::MemoryStore;
    use crate::regime::FeatureVector;
    use crate::runtime_config::RuntimeConfig;
    use chrono::Duration as ChronoDuration;

    struct Harness {
        registry: Arc<ParameterRegistry>,
        tracker: Arc<OutcomeTracker>,
        regime: Arc<RegimeClassifier>,
        engine: ValidationEngine,
    }

    fn harness(min_samples: usize) -> Harness {
        let mut cfg = RuntimeConfig::default();
        cfg.validation.min_samples = min_samples;
        let registry = Arc::new(
            ParameterRegistry::load(&cfg, Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
                .unwrap(),
        );
        let tracker = Arc::new(
            OutcomeTracker::load(&cfg.outcomes, Arc::new(MemoryStore::new())).unwrap(),
        );
        let regime = RegimeClassifier::new(&cfg.regime);
        let engine = ValidationEngine::new(
            cfg.validation.clone(),
            RewardMode::Raw,
            registry.clone(),
            tracker.clone(),
            regime.clone(),
        );
        Harness {
            registry,
            tracker,
            regime,
            engine,
        }
    }

    fn settle_regime(regime: &RegimeClassifier) {
        let trending = FeatureVector {
            trend: 0.40,
            volatility: 0.45,
            dispersion: 0.25,
        };
        for _ in 0..3 {
            regime.classify(&trending);
        }
    }

    /// Record `n` resolved decisions under `variant` with the given returns.
    fn decide_n(h: &Harness, variant: Variant, instruments: &[&str], scan: &str, returns: &[f64]) {
        let snap = h.registry.snapshot();
        let snapshot = match &variant {
            Variant::LiveCandidate { experiments } => {
                snap.with_candidates(experiments.iter().map(String::as_str))
            }
            Variant::Shadow { experiment_id } => snap.with_candidates([experiment_id.as_str()]),
            Variant::LiveBaseline => (*snap).clone(),
        };
        for (inst, r) in instruments.iter().zip(returns) {
            let id = h
                .tracker
                .record_decision(
                    inst,
                    snapshot.clone(),
                    0.5,
                    DecisionContext {
                        scan_id: scan.into(),
                        regime: Some("trending".into()),
                        variant: variant.clone(),
                        decided_at: Utc::now(),
                    },
                )
                .unwrap();
            h.tracker.attach_outcome(&id, "1d", *r).unwrap();
        }
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("I{i:03}")).collect()
    }

    fn into_rollout(h: &Harness) -> String {
        let exp = h.registry.propose("theme_heat_weight", 0.25).unwrap();
        h.registry.promote(&exp).unwrap();
        exp
    }

    #[test]
    fn underperforming_rollout_is_rolled_back() {
        let h = harness(10);
        settle_regime(&h.regime);
        let exp = into_rollout(&h);

        let insts = names(20);
        let refs: Vec<&str> = insts.iter().map(String::as_str).collect();
        let base: Vec<f64> = (0..20).map(|i| 0.010 + (i % 2) as f64 * 0.001).collect();
        let cand: Vec<f64> = (0..20).map(|i| -0.010 + (i % 2) as f64 * 0.001).collect();
        decide_n(&h, Variant::LiveBaseline, &refs, "s1", &base);
        decide_n(
            &h,
            Variant::LiveCandidate {
                experiments: vec![exp.clone()],
            },
            &refs,
            "s2",
            &cand,
        );

        match h.engine.evaluate(&exp, Utc::now()) {
            ValidationOutcome::RolledBack {
                restored_value,
                candidate_value,
                ..
            } => {
                assert!((restored_value - 0.18).abs() < 1e-12);
                assert!((candidate_value - 0.25).abs() < 1e-12);
            }
            other => panic!("unexpected {other:?}"),
        }
        let p = h.registry.parameter("theme_heat_weight").unwrap();
        assert_eq!(p.status, ParameterStatus::Static);
        assert!((p.value - 0.18).abs() < 1e-12);
        let e = h.registry.experiment(&exp).unwrap();
        assert!(e.outcome_summary.is_some());
        assert!(!e.is_open());
    }

    #[test]
    fn healthy_rollout_is_promoted_to_active() {
        let h = harness(10);
        settle_regime(&h.regime);
        let exp = into_rollout(&h);

        let insts = names(20);
        let refs: Vec<&str> = insts.iter().map(String::as_str).collect();
        let returns: Vec<f64> = (0..20).map(|i| 0.010 + (i % 2) as f64 * 0.001).collect();
        decide_n(&h, Variant::LiveBaseline, &refs, "s1", &returns);
        decide_n(
            &h,
            Variant::LiveCandidate {
                experiments: vec![exp.clone()],
            },
            &refs,
            "s2",
            &returns,
        );

        assert!(matches!(
            h.engine.evaluate(&exp, Utc::now()),
            ValidationOutcome::Promoted {
                to: ParameterStatus::Active,
                ..
            }
        ));
        assert!((h.registry.get_active("theme_heat_weight", None).unwrap() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn shadow_pairs_with_live_records() {
        let h = harness(5);
        settle_regime(&h.regime);
        let exp = h.registry.propose("theme_heat_weight", 0.25).unwrap();

        let insts = names(8);
        let refs: Vec<&str> = insts.iter().map(String::as_str).collect();
        let returns: Vec<f64> = (0..8).map(|i| 0.004 + (i % 3) as f64 * 0.001).collect();
        decide_n(&h, Variant::LiveBaseline, &refs, "s1", &returns);
        decide_n(
            &h,
            Variant::Shadow {
                experiment_id: exp.clone(),
            },
            &refs,
            "s1",
            &returns,
        );
        // Unpaired shadow records are ignored.
        decide_n(
            &h,
            Variant::Shadow {
                experiment_id: exp.clone(),
            },
            &["LONELY"],
            "s9",
            &[-1.0],
        );

        assert!(matches!(
            h.engine.evaluate(&exp, Utc::now()),
            ValidationOutcome::Promoted {
                to: ParameterStatus::Rollout,
                ..
            }
        ));
        let summary = h.registry.experiment(&exp).unwrap().outcome_summary.unwrap();
        assert_eq!(summary.candidate_n, 8);
        assert_eq!(summary.baseline_n, 8);
    }

    #[test]
    fn holds_on_thin_data_then_rolls_back_when_expired() {
        let h = harness(30);
        settle_regime(&h.regime);
        let exp = into_rollout(&h);

        match h.engine.evaluate(&exp, Utc::now()) {
            ValidationOutcome::Held {
                reason: ValidationInconclusive::InsufficientSamples { required, .. },
                ..
            } => assert_eq!(required, 30),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            h.registry.parameter("theme_heat_weight").unwrap().status,
            ParameterStatus::Rollout
        );

        let later = Utc::now() + ChronoDuration::days(30);
        assert!(matches!(
            h.engine.evaluate(&exp, later),
            ValidationOutcome::RolledBack { .. }
        ));
    }

    #[test]
    fn unstable_regime_holds() {
        let h = harness(5);
        // No classification yet.
        let exp = into_rollout(&h);
        let insts = names(10);
        let refs: Vec<&str> = insts.iter().map(String::as_str).collect();
        let returns = vec![0.01; 10];
        decide_n(&h, Variant::LiveBaseline, &refs, "s1", &returns);
        decide_n(
            &h,
            Variant::LiveCandidate {
                experiments: vec![exp.clone()],
            },
            &refs,
            "s2",
            &returns,
        );
        assert!(matches!(
            h.engine.evaluate(&exp, Utc::now()),
            ValidationOutcome::Held {
                reason: ValidationInconclusive::RegimeUnstable,
                ..
            }
        ));
        assert_eq!(h.engine.evaluate_all(Utc::now()).len(), 1);
    }
}
