// =============================================================================
// Shared types used across the Confluence engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Ticker-like identifier of a single instrument in the universe.
pub type InstrumentId = String;

/// Name of a signal component (e.g. "price", "social_buzz").
pub type DataType = String;

/// Identifier of an external data provider.
pub type SourceId = String;

/// Per-instrument lifecycle inside one scan batch.
///
/// `Pending -> Fetching -> {Scored | Degraded | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentStatus {
    Pending,
    Fetching,
    Scored,
    Degraded,
    Failed,
}

impl InstrumentStatus {
    /// Terminal statuses are the only ones a finished scan may report.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Scored | Self::Degraded | Self::Failed)
    }

    /// Whether `self -> next` is a legal edge of the state machine.
    pub fn can_transition_to(self, next: InstrumentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Fetching)
                | (Self::Pending, Self::Failed)
                | (Self::Fetching, Self::Scored)
                | (Self::Fetching, Self::Degraded)
                | (Self::Fetching, Self::Failed)
        )
    }
}

impl std::fmt::Display for InstrumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Fetching => write!(f, "fetching"),
            Self::Scored => write!(f, "scored"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle status of a tunable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterStatus {
    /// Running on its configured default; never tuned or fully rolled back.
    Static,
    /// A candidate is being evaluated without touching production output.
    Shadow,
    /// A candidate is applied to a fraction of scan traffic.
    Rollout,
    /// A validated tuned value is in production.
    Active,
}

impl Default for ParameterStatus {
    fn default() -> Self {
        Self::Static
    }
}

impl std::fmt::Display for ParameterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static => write!(f, "static"),
            Self::Shadow => write!(f, "shadow"),
            Self::Rollout => write!(f, "rollout"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// Why a component is absent from an instrument's partial result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingReason {
    /// Provider says the data does not exist (never retried).
    NotFound,
    /// Retries and fallback exhausted.
    Unavailable,
    /// The scan deadline fired while the fetch was still in flight.
    TimedOut,
}

impl std::fmt::Display for MissingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}
