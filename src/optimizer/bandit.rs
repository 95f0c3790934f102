// =============================================================================
// Thompson-sampling bandit over discretised parameter values
// =============================================================================
//
// Each tunable parameter gets `arms` candidate values spread evenly across
// its bounds.  An observation is credited to the arm nearest the value that
// was in effect for the decision.  Per arm the posterior of the mean reward
// is Gaussian, shrunk toward zero by one pseudo-observation:
//
//   mean_post = n·x̄ / (n + 1)
//   sd_post   = sqrt(s² / (n + 1))        s² = sample variance (prior 1e-3)
//
// `suggest` draws once from every arm and returns the winner.  Confidence is
// the share of `CONFIDENCE_DRAWS` draws won by the arm with the best
// posterior mean.
// =============================================================================

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::Serialize;

use super::{Observation, Optimizer, Suggestion};
use crate::error::OptimizerError;
use crate::params::Parameter;

const PRIOR_VARIANCE: f64 = 1e-3;
const CONFIDENCE_DRAWS: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct ArmPosterior {
    pub value: f64,
    pub n: u64,
    mean: f64,
    m2: f64,
}

impl ArmPosterior {
    fn new(value: f64) -> Self {
        Self {
            value,
            n: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    fn update(&mut self, reward: f64) {
        self.n += 1;
        let delta = reward - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (reward - self.mean);
    }

    pub fn posterior_mean(&self) -> f64 {
        let n = self.n as f64;
        n * self.mean / (n + 1.0)
    }

    pub fn posterior_sd(&self) -> f64 {
        let variance = if self.n >= 2 {
            (self.m2 / (self.n - 1) as f64).max(PRIOR_VARIANCE * 1e-3)
        } else {
            PRIOR_VARIANCE
        };
        (variance / (self.n as f64 + 1.0)).sqrt()
    }

    fn sample(&self, rng: &mut StdRng) -> f64 {
        match Normal::new(self.posterior_mean(), self.posterior_sd()) {
            Ok(dist) => dist.sample(rng),
            Err(_) => self.posterior_mean(),
        }
    }
}

#[derive(Debug, Clone)]
struct ParameterArms {
    lower: f64,
    upper: f64,
    arms: Vec<ArmPosterior>,
    /// Arm index → total samples when it was rejected.
    cooldown: HashMap<usize, u64>,
}

impl ParameterArms {
    fn new(lower: f64, upper: f64, count: usize) -> Self {
        let count = if upper > lower { count.max(2) } else { 1 };
        let step = if count > 1 {
            (upper - lower) / (count - 1) as f64
        } else {
            0.0
        };
        Self {
            lower,
            upper,
            arms: (0..count)
                .map(|i| ArmPosterior::new(lower + step * i as f64))
                .collect(),
            cooldown: HashMap::new(),
        }
    }

    fn nearest(&self, value: f64) -> usize {
        let v = value.clamp(self.lower, self.upper);
        self.arms
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                (a.value - v)
                    .abs()
                    .partial_cmp(&(b.value - v).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    fn samples(&self) -> u64 {
        self.arms.iter().map(|a| a.n).sum()
    }

    fn eligible(&self, min_samples: u64) -> Vec<usize> {
        let total = self.samples();
        (0..self.arms.len())
            .filter(|i| {
                self.cooldown
                    .get(i)
                    .map_or(true, |at| total >= at + min_samples)
            })
            .collect()
    }
}

pub struct ThompsonBandit {
    arm_count: usize,
    min_samples: u64,
    parameters: HashMap<String, ParameterArms>,
    rng: StdRng,
}

impl ThompsonBandit {
    pub fn new(arm_count: usize, min_samples: u64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            arm_count: arm_count.max(2),
            min_samples,
            parameters: HashMap::new(),
            rng,
        }
    }

    fn arms_for(&mut self, parameter: &Parameter) -> &mut ParameterArms {
        let count = self.arm_count;
        self.parameters
            .entry(parameter.id.clone())
            .or_insert_with(|| ParameterArms::new(parameter.lower_bound, parameter.upper_bound, count))
    }

    pub fn arms(&self, parameter_id: &str) -> Vec<ArmPosterior> {
        self.parameters
            .get(parameter_id)
            .map(|p| p.arms.clone())
            .unwrap_or_default()
    }

    /// Register bounds for a parameter before observations arrive.
    pub fn ensure(&mut self, parameter: &Parameter) {
        self.arms_for(parameter);
    }

    fn observe(&mut self, obs: &Observation) {
        if let Some(arms) = self.parameters.get_mut(&obs.parameter_id) {
            if obs.reward.is_finite() && obs.value.is_finite() {
                let idx = arms.nearest(obs.value);
                arms.arms[idx].update(obs.reward);
            }
        }
    }
}

impl Optimizer for ThompsonBandit {
    fn name(&self) -> &'static str {
        "bandit"
    }

    fn train(&mut self, parameters: &[Parameter], observations: &[Observation]) {
        // Rejections outlive retraining.
        let cooldowns: HashMap<String, HashMap<usize, u64>> = self
            .parameters
            .drain()
            .map(|(id, arms)| (id, arms.cooldown))
            .collect();
        for p in parameters {
            self.ensure(p);
        }
        for (id, cooldown) in cooldowns {
            if let Some(arms) = self.parameters.get_mut(&id) {
                arms.cooldown = cooldown;
            }
        }
        for obs in observations {
            self.observe(obs);
        }
    }

    fn update(&mut self, observation: &Observation) {
        self.observe(observation);
    }

    fn suggest(
        &mut self,
        parameter: &Parameter,
        _regime: Option<&str>,
    ) -> Result<Suggestion, OptimizerError> {
        let min_samples = self.min_samples;
        let samples = self.arms_for(parameter).samples();
        if samples < min_samples {
            return Err(OptimizerError::InsufficientData {
                parameter_id: parameter.id.clone(),
                samples,
                required: min_samples,
            });
        }

        let arms = self
            .parameters
            .get(&parameter.id)
            .cloned()
            .ok_or_else(|| OptimizerError::InsufficientData {
                parameter_id: parameter.id.clone(),
                samples: 0,
                required: min_samples,
            })?;
        let eligible = arms.eligible(min_samples);
        if eligible.is_empty() {
            return Err(OptimizerError::NoCandidate(parameter.id.clone()));
        }

        let pick = |rng: &mut StdRng| {
            eligible
                .iter()
                .copied()
                .map(|i| (i, arms.arms[i].sample(rng)))
                .fold((eligible[0], f64::NEG_INFINITY), |best, (i, s)| {
                    if s > best.1 {
                        (i, s)
                    } else {
                        best
                    }
                })
                .0
        };

        let chosen = pick(&mut self.rng);
        let current = arms.nearest(parameter.value);
        if chosen == current || (arms.arms[chosen].value - parameter.value).abs() < 1e-12 {
            return Err(OptimizerError::NoCandidate(parameter.id.clone()));
        }

        let best_mean = eligible
            .iter()
            .copied()
            .max_by(|&a, &b| {
                arms.arms[a]
                    .posterior_mean()
                    .partial_cmp(&arms.arms[b].posterior_mean())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(chosen);
        let wins = (0..CONFIDENCE_DRAWS)
            .filter(|_| pick(&mut self.rng) == best_mean)
            .count();

        Ok(Suggestion {
            parameter_id: parameter.id.clone(),
            value: arms.arms[chosen].value,
            confidence: wins as f64 / CONFIDENCE_DRAWS as f64,
            samples,
        })
    }

    fn on_rejected(&mut self, parameter_id: &str, value: f64) {
        if let Some(arms) = self.parameters.get_mut(parameter_id) {
            let idx = arms.nearest(value);
            let total = arms.samples();
            arms.cooldown.insert(idx, total);
        }
    }

    fn samples(&self, parameter_id: &str) -> u64 {
        self.parameters
            .get(parameter_id)
            .map_or(0, ParameterArms::samples)
    }
}
