// =============================================================================
// Statistical Optimizer — proposes candidate parameter values from outcomes
// =============================================================================
//
// Strategy tiers, chosen by `optimizer.strategy`:
//
//   bandit         one Thompson bandit per parameter, all regimes pooled
//   regime_bandit  one bandit per regime, pooled fallback on thin data
//   neural         not shipped; falls back to `noop` with a warning
//   noop           never suggests anything
//
// Optimizers only ever suggest.  The registry decides whether a suggestion
// becomes an experiment, and validation decides whether it survives.
// =============================================================================

pub mod bandit;
pub mod regime_bandit;

use serde::Serialize;
use tracing::warn;

use crate::error::OptimizerError;
use crate::outcome::OutcomeRecord;
use crate::params::Parameter;
use crate::runtime_config::{OptimizerStrategy, RuntimeConfig};

pub use bandit::ThompsonBandit;
pub use regime_bandit::RegimeBandit;

/// One (parameter value → reward) data point extracted from an outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub parameter_id: String,
    pub value: f64,
    pub reward: f64,
    pub regime: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub parameter_id: String,
    pub value: f64,
    /// Posterior probability that the suggested arm is the best one.
    pub confidence: f64,
    pub samples: u64,
}

pub trait Optimizer: Send {
    fn name(&self) -> &'static str;

    /// Rebuild all posteriors from scratch.
    fn train(&mut self, parameters: &[Parameter], observations: &[Observation]);

    fn update(&mut self, observation: &Observation);

    fn suggest(
        &mut self,
        parameter: &Parameter,
        regime: Option<&str>,
    ) -> Result<Suggestion, OptimizerError>;

    /// A suggestion of `value` failed validation.
    fn on_rejected(&mut self, parameter_id: &str, value: f64);

    fn samples(&self, parameter_id: &str) -> u64;
}

/// Turn resolved outcome records into per-parameter observations.
///
/// A record only speaks for the parameters that actually scored it: the
/// weight of each configured component under the record's regime plus the
/// threshold.  Records without a result at the reward horizon are skipped.
pub fn observations(config: &RuntimeConfig, records: &[OutcomeRecord]) -> Vec<Observation> {
    let horizon = &config.optimizer.reward_horizon;
    let mode = config.optimizer.reward_mode;
    let mut out = Vec::new();

    for record in records {
        let Some(realized) = record.result(horizon) else {
            continue;
        };
        let reward = mode.reward(record.predicted_score, realized);
        let regime = record.regime.as_deref();

        let used = config
            .data_types
            .iter()
            .map(|dt| config.weight_parameter(&dt.name, regime))
            .chain(std::iter::once(config.threshold_parameter.clone()));
        for parameter_id in used {
            if let Some(value) = record.parameter_value(&parameter_id) {
                out.push(Observation {
                    parameter_id,
                    value,
                    reward,
                    regime: record.regime.clone(),
                });
            }
        }
    }
    out
}

/// Always reports insufficient data.  Used when learning is off or a tier is
/// unavailable.
#[derive(Debug, Default)]
pub struct NoopOptimizer;

impl Optimizer for NoopOptimizer {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn train(&mut self, _parameters: &[Parameter], _observations: &[Observation]) {}

    fn update(&mut self, _observation: &Observation) {}

    fn suggest(
        &mut self,
        parameter: &Parameter,
        _regime: Option<&str>,
    ) -> Result<Suggestion, OptimizerError> {
        Err(OptimizerError::InsufficientData {
            parameter_id: parameter.id.clone(),
            samples: 0,
            required: u64::MAX,
        })
    }

    fn on_rejected(&mut self, _parameter_id: &str, _value: f64) {}

    fn samples(&self, _parameter_id: &str) -> u64 {
        0
    }
}

pub fn build_optimizer(config: &RuntimeConfig) -> Box<dyn Optimizer> {
    let oc = &config.optimizer;
    match oc.strategy {
        OptimizerStrategy::Bandit => Box::new(ThompsonBandit::new(oc.arms, oc.min_samples, oc.seed)),
        OptimizerStrategy::RegimeBandit => Box::new(RegimeBandit::new(oc)),
        OptimizerStrategy::Neural => {
            warn!("neural optimizer not available in this build; learning disabled");
            Box::new(NoopOptimizer)
        }
        OptimizerStrategy::Noop => Box::new(NoopOptimizer),
    }
}
