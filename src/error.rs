// =============================================================================
// Domain error taxonomy
// =============================================================================
//
// Plumbing (config files, persistence I/O, startup) propagates `anyhow`.
// The enums below are the errors callers are expected to match on.
//
// Waiting for a rate-limit token and missing the cache are control flow and
// have no error variants.
// =============================================================================

use serde::Serialize;
use thiserror::Error;

/// Failure reported by an external data provider.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderError {
    /// Transient failure; retried with backoff, then the fallback provider.
    #[error("provider {source_id} unavailable: {reason}")]
    Unavailable { source_id: String, reason: String },

    /// Permanent for this instrument/data type; never retried.
    #[error("{data_type} not found for {instrument_id} at {source_id}")]
    NotFound {
        source_id: String,
        instrument_id: String,
        data_type: String,
    },
}

impl ProviderError {
    pub fn unavailable(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(
        source_id: impl Into<String>,
        instrument_id: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            source_id: source_id.into(),
            instrument_id: instrument_id.into(),
            data_type: data_type.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Errors raised by the parameter registry's write path.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("candidate {value} for '{parameter_id}' outside bounds [{lower}, {upper}]")]
    ParameterOutOfBounds {
        parameter_id: String,
        value: f64,
        lower: f64,
        upper: f64,
    },

    #[error("parameter '{parameter_id}' already has experiment {experiment_id} in flight")]
    ExperimentInFlight {
        parameter_id: String,
        experiment_id: String,
    },

    #[error("parameter '{0}' is not tunable")]
    NotTunable(String),

    #[error("unknown experiment '{0}'")]
    UnknownExperiment(String),

    #[error("experiment '{0}' is already closed")]
    ExperimentClosed(String),

    #[error("parameter '{0}' is static; nothing to roll back")]
    NothingToRollBack(String),

    #[error("failed to persist registry change: {0}")]
    Persistence(String),
}

/// Errors from a statistical optimizer strategy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizerError {
    /// Cold-start guard: not enough outcomes to say anything.
    #[error("insufficient data for '{parameter_id}': {samples} samples, {required} required")]
    InsufficientData {
        parameter_id: String,
        samples: u64,
        required: u64,
    },

    /// The best-looking value is the one already in production.
    #[error("no candidate better than the current value of '{0}'")]
    NoCandidate(String),
}

/// Errors from the append-only outcome tracker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OutcomeError {
    #[error("unknown decision '{0}'")]
    UnknownDecision(String),

    #[error("horizon '{0}' is not configured")]
    UnknownHorizon(String),

    #[error("decision '{decision_id}' already has a result for horizon '{horizon}'")]
    HorizonAlreadyAttached { decision_id: String, horizon: String },

    #[error("failed to persist outcome record: {0}")]
    Persistence(String),
}

/// Reasons the validation engine holds a candidate at its current stage.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ValidationInconclusive {
    #[error("need {required} samples per arm, have baseline={baseline} candidate={candidate}")]
    InsufficientSamples {
        baseline: usize,
        candidate: usize,
        required: usize,
    },

    #[error("regime unstable; holding")]
    RegimeUnstable,

    #[error("difference {diff:.5} within uncertainty (stderr {stderr:.5})")]
    WithinUncertainty { diff: f64, stderr: f64 },

    #[error("registry rejected transition: {0}")]
    Registry(String),
}
