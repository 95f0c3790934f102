// =============================================================================
// Regime — discrete market state estimation
// =============================================================================

pub mod classifier;
pub mod features;

pub use classifier::{RegimeClassifier, RegimeState};
pub use features::FeatureVector;
