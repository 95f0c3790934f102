// =============================================================================
// Notification sinks — where scan events go
// =============================================================================
//
// The coordinator emits one `InstrumentResult` per instrument and one
// `ScanBatchCompleted` per batch.  Emitting never blocks and never fails
// the scan.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::scan::{BatchSummary, InstrumentResult};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    InstrumentResult(InstrumentResult),
    ScanBatchCompleted(BatchSummary),
}

pub trait NotificationSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Writes events as structured log lines.
#[derive(Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn emit(&self, event: &Event) {
        match event {
            Event::InstrumentResult(r) => info!(
                scan_id = %r.scan_id,
                instrument = %r.instrument_id,
                status = %r.status,
                score = r.composite_score.map(|s| format!("{s:.4}")).unwrap_or_default(),
                rank = r.rank.unwrap_or(0),
                missing = r.missing.len(),
                "instrument result"
            ),
            Event::ScanBatchCompleted(b) => info!(
                scan_id = %b.scan_id,
                requested = b.requested,
                scored = b.scored,
                degraded = b.degraded,
                failed = b.failed,
                regime = b.regime.as_deref().unwrap_or("-"),
                duration_ms = b.duration_ms,
                timed_out = b.timed_out,
                "scan batch completed"
            ),
        }
    }
}

/// Fans events out to in-process subscribers over a broadcast channel.
/// Lagging or absent subscribers are not the sink's problem.
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn emit(&self, event: &Event) {
        let _ = self.tx.send(event.clone());
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

impl NotificationSink for FanoutSink {
    fn emit(&self, event: &Event) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
