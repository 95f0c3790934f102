// =============================================================================
// Confluence — adaptive multi-source confluence scoring engine
// =============================================================================
//
// Fetches heterogeneous signals per instrument under per-source rate limits,
// scores them with a regime-aware weighted composite, and tunes the weights
// over time through shadow → rollout → active experiments gated by
// statistical validation on realized outcomes.
// =============================================================================

pub mod api;
pub mod app_state;
pub mod cache;
pub mod error;
pub mod fetch;
pub mod notify;
pub mod optimizer;
pub mod outcome;
pub mod params;
pub mod persistence;
pub mod providers;
pub mod regime;
pub mod runtime_config;
pub mod scan;
pub mod types;
pub mod validation;

pub use app_state::{AppState, Stores};
pub use runtime_config::RuntimeConfig;
