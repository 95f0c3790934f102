// =============================================================================
// Outcome Resolver — realizes elapsed horizons through the provider interface
// =============================================================================
//
// For every horizon, decisions that are due are grouped by (instrument,
// as_of) so live and shadow records of the same instrument share one
// provider call.  `as_of` is `created_at + horizon`.  Failures are logged
// and retried on the next cycle.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::tracker::OutcomeTracker;
use crate::providers::{Provider, RateLimiter};
use crate::runtime_config::OutcomeConfig;

const RESOLVE_CONCURRENCY: usize = 8;

pub struct OutcomeResolver {
    tracker: Arc<OutcomeTracker>,
    provider: Arc<dyn Provider>,
    limiter: Arc<RateLimiter>,
    data_type: String,
}

impl OutcomeResolver {
    pub fn new(
        config: &OutcomeConfig,
        tracker: Arc<OutcomeTracker>,
        provider: Arc<dyn Provider>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            tracker,
            provider,
            limiter,
            data_type: config.outcome_data_type.clone(),
        }
    }

    /// Attach every result that can be realized as of `now`.  Returns the
    /// number of attachments made.
    pub async fn resolve_due(&self, now: DateTime<Utc>) -> usize {
        let mut attached = 0;
        for horizon in self.tracker.horizons().to_vec() {
            let due = match self.tracker.due_for(&horizon.label, now) {
                Ok(d) => d,
                Err(e) => {
                    warn!(horizon = %horizon.label, error = %e, "cannot list due outcomes");
                    continue;
                }
            };
            if due.is_empty() {
                continue;
            }

            let mut groups: BTreeMap<(String, DateTime<Utc>), Vec<String>> = BTreeMap::new();
            for record in due {
                let Some(as_of) = horizon.due_at(record.created_at) else {
                    continue;
                };
                groups
                    .entry((record.instrument_id.clone(), as_of))
                    .or_default()
                    .push(record.decision_id);
            }

            let fetched: Vec<_> = stream::iter(groups)
                .map(|((instrument_id, as_of), decisions)| async move {
                    self.limiter.acquire(self.provider.id(), 1).await;
                    let result = self
                        .provider
                        .fetch(&instrument_id, &self.data_type, as_of)
                        .await;
                    (instrument_id, decisions, result)
                })
                .buffer_unordered(RESOLVE_CONCURRENCY)
                .collect()
                .await;

            for (instrument_id, decisions, result) in fetched {
                match result {
                    Ok(reading) => {
                        for decision_id in decisions {
                            match self
                                .tracker
                                .attach_outcome(&decision_id, &horizon.label, reading.value)
                            {
                                Ok(()) => attached += 1,
                                Err(e) => warn!(decision = %decision_id, error = %e, "attach failed"),
                            }
                        }
                    }
                    Err(e) => debug!(
                        instrument = %instrument_id,
                        horizon = %horizon.label,
                        error = %e,
                        "outcome not yet available"
                    ),
                }
            }
        }

        if attached > 0 {
            info!(attached, "outcomes resolved");
        }
        attached
    }
}
