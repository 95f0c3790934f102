// =============================================================================
// Regime-conditioned bandit
// =============================================================================
//
// Keeps a pooled bandit plus one bandit per regime label.  A suggestion for
// a regime uses that regime's posteriors once they hold at least
// `min_regime_samples` observations of the parameter; before that the
// pooled bandit answers.
// =============================================================================

use std::collections::HashMap;

use tracing::debug;

use super::{Observation, Optimizer, Suggestion, ThompsonBandit};
use crate::error::OptimizerError;
use crate::params::Parameter;
use crate::runtime_config::OptimizerConfig;

pub struct RegimeBandit {
    pooled: ThompsonBandit,
    by_regime: HashMap<String, ThompsonBandit>,
    parameters: Vec<Parameter>,
    arms: usize,
    min_samples: u64,
    min_regime_samples: u64,
    seed: Option<u64>,
}

impl RegimeBandit {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            pooled: ThompsonBandit::new(config.arms, config.min_samples, config.seed),
            by_regime: HashMap::new(),
            parameters: Vec::new(),
            arms: config.arms,
            min_samples: config.min_samples,
            min_regime_samples: config.min_regime_samples,
            seed: config.seed,
        }
    }

    fn regime_bandit(&mut self, regime: &str) -> &mut ThompsonBandit {
        let (arms, min, seed) = (self.arms, self.min_samples, self.seed);
        let parameters = &self.parameters;
        self.by_regime.entry(regime.to_string()).or_insert_with(|| {
            let mut b = ThompsonBandit::new(arms, min, seed);
            b.train(parameters, &[]);
            b
        })
    }

    pub fn regimes(&self) -> Vec<String> {
        let mut labels: Vec<_> = self.by_regime.keys().cloned().collect();
        labels.sort();
        labels
    }
}

impl Optimizer for RegimeBandit {
    fn name(&self) -> &'static str {
        "regime_bandit"
    }

    fn train(&mut self, parameters: &[Parameter], observations: &[Observation]) {
        self.parameters = parameters.to_vec();
        self.pooled.train(parameters, observations);
        for bandit in self.by_regime.values_mut() {
            bandit.train(parameters, &[]);
        }
        for obs in observations {
            if let Some(regime) = obs.regime.clone() {
                self.regime_bandit(&regime).update(obs);
            }
        }
    }

    fn update(&mut self, observation: &Observation) {
        self.pooled.update(observation);
        if let Some(regime) = observation.regime.clone() {
            self.regime_bandit(&regime).update(observation);
        }
    }

    fn suggest(
        &mut self,
        parameter: &Parameter,
        regime: Option<&str>,
    ) -> Result<Suggestion, OptimizerError> {
        if let Some(label) = regime {
            let threshold = self.min_regime_samples;
            if let Some(bandit) = self.by_regime.get_mut(label) {
                let n = bandit.samples(&parameter.id);
                if n >= threshold {
                    return bandit.suggest(parameter, regime);
                }
                debug!(
                    parameter = %parameter.id,
                    regime = label,
                    samples = n,
                    "regime data thin; using pooled posterior"
                );
            }
        }
        self.pooled.suggest(parameter, regime)
    }

    fn on_rejected(&mut self, parameter_id: &str, value: f64) {
        self.pooled.on_rejected(parameter_id, value);
        for bandit in self.by_regime.values_mut() {
            bandit.on_rejected(parameter_id, value);
        }
    }

    fn samples(&self, parameter_id: &str) -> u64 {
        self.pooled.samples(parameter_id)
    }
}
