// =============================================================================
// Demo Provider — deterministic synthetic signals
// =============================================================================
//
// Used when a source has no `base_url`, so the engine can run end to end
// without live credentials.  Values are a pure function of (source,
// instrument, data type, hour of `as_of`): repeated calls within the same
// hour agree, which keeps cache behaviour observable.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use sha2::{Digest, Sha256};

use super::{Provider, SignalReading};
use crate::error::ProviderError;

/// Data type that the outcome resolver requests; scaled like a return.
const FORWARD_RETURN: &str = "forward_return";

#[derive(Debug, Clone)]
pub struct DemoProvider {
    id: String,
}

impl DemoProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Uniform-ish value in `[-1, 1]` derived from the inputs.
    fn unit_value(&self, instrument_id: &str, data_type: &str, as_of: DateTime<Utc>) -> f64 {
        let hour = as_of.with_minute(0).and_then(|t| t.with_second(0)).unwrap_or(as_of);
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(instrument_id.as_bytes());
        hasher.update(data_type.as_bytes());
        hasher.update(hour.timestamp().to_le_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let x = u64::from_le_bytes(bytes) as f64 / u64::MAX as f64;
        x * 2.0 - 1.0
    }
}

#[async_trait]
impl Provider for DemoProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(
        &self,
        instrument_id: &str,
        data_type: &str,
        as_of: DateTime<Utc>,
    ) -> Result<SignalReading, ProviderError> {
        let unit = self.unit_value(instrument_id, data_type, as_of);
        let value = if data_type == FORWARD_RETURN {
            unit * 0.05
        } else {
            unit
        };
        Ok(SignalReading {
            value,
            as_of,
            source_id: self.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_hour_same_value() {
        let p = DemoProvider::new("market");
        let t = DateTime::parse_from_rfc3339("2026-03-01T10:05:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let t2 = DateTime::parse_from_rfc3339("2026-03-01T10:55:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let a = p.fetch("AAPL", "price", t).await.unwrap();
        let b = p.fetch("AAPL", "price", t2).await.unwrap();
        assert_eq!(a.value, b.value);
        assert!((-1.0..=1.0).contains(&a.value));
    }

    #[tokio::test]
    async fn forward_returns_are_small() {
        let p = DemoProvider::new("market");
        let r = p.fetch("MSFT", FORWARD_RETURN, Utc::now()).await.unwrap();
        assert!(r.value.abs() <= 0.05);
    }
}
