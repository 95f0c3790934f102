// =============================================================================
// Rate Limiter — per-source token buckets over atomic state
// =============================================================================
//
// Each provider gets an independent token bucket refilled continuously at
// `refill_rate` tokens/second up to `burst`.  The bucket is stored in its
// virtual-schedule form: a single atomic "theoretical arrival time" (TAT).
//
//   reserve(cost):  tat' = max(tat, now) + cost / rate
//                   grant at  tat' - burst / rate
//
// Every caller reserves with one compare-and-swap, so grants are handed out
// in the order reservations were made (FIFO) and no lock is ever held.  A
// reservation is consumed even if its waiter is later cancelled, which can
// only under-use the bucket, never oversubscribe it.
//
// `acquire` never fails.  Callers bound their total wait with an outer
// timeout (the scan deadline).
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::runtime_config::SourceConfig;
use crate::types::SourceId;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Serialisable view of one bucket, for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterState {
    pub source_id: SourceId,
    /// Tokens currently available, always within `[0, burst]`.
    pub tokens: f64,
    pub refill_rate: f64,
    pub burst: f64,
    pub last_refill_at: DateTime<Utc>,
    pub grants: u64,
    pub total_wait_ms: u64,
}

/// Outcome of a single `acquire`.
#[derive(Debug, Clone, Copy)]
pub struct Grant {
    pub waited: Duration,
    pub granted_at: Instant,
}

/// A single lock-free token bucket.
pub struct TokenBucket {
    source_id: SourceId,
    refill_rate: f64,
    burst: f64,
    /// Nanoseconds per token.
    interval_ns: u64,
    /// `burst * interval_ns`: how far ahead of now the schedule may run
    /// before callers must wait.
    tolerance_ns: u64,
    /// Theoretical arrival time, nanoseconds since `origin`.
    tat_ns: AtomicU64,
    origin: Instant,
    grants: AtomicU64,
    total_wait_ns: AtomicU64,
}

impl TokenBucket {
    pub fn new(source_id: impl Into<SourceId>, refill_rate: f64, burst: f64) -> Self {
        let refill_rate = if refill_rate > 0.0 { refill_rate } else { 1.0 };
        let burst = burst.max(1.0);
        let interval_ns = (NANOS_PER_SEC / refill_rate).round().max(1.0) as u64;
        let tolerance_ns = (burst * interval_ns as f64).round() as u64;
        Self {
            source_id: source_id.into(),
            refill_rate,
            burst,
            interval_ns,
            tolerance_ns,
            tat_ns: AtomicU64::new(0),
            origin: Instant::now(),
            grants: AtomicU64::new(0),
            total_wait_ns: AtomicU64::new(0),
        }
    }

    fn now_ns(&self) -> u64 {
        Instant::now().duration_since(self.origin).as_nanos() as u64
    }

    /// Reserve `cost` tokens and return how long the caller must wait.
    fn reserve(&self, cost: u32) -> Duration {
        let increment = self.interval_ns.saturating_mul(u64::from(cost.max(1)));
        loop {
            let now = self.now_ns();
            let prev = self.tat_ns.load(Ordering::Acquire);
            let new_tat = prev.max(now).saturating_add(increment);
            if self
                .tat_ns
                .compare_exchange_weak(prev, new_tat, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let allowed_at = new_tat.saturating_sub(self.tolerance_ns);
                return Duration::from_nanos(allowed_at.saturating_sub(now));
            }
        }
    }

    /// Wait the minimum time needed, then grant `cost` tokens.
    pub async fn acquire(&self, cost: u32) -> Grant {
        let wait = self.reserve(cost);
        if !wait.is_zero() {
            debug!(
                source = %self.source_id,
                cost,
                wait_ms = wait.as_millis() as u64,
                "rate limiter: waiting for tokens"
            );
            tokio::time::sleep(wait).await;
        }
        self.grants.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ns
            .fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);
        trace!(source = %self.source_id, cost, "rate limiter: granted");
        Grant {
            waited: wait,
            granted_at: Instant::now(),
        }
    }

    /// Tokens available right now, clamped to `[0, burst]`.
    pub fn available(&self) -> f64 {
        let now = self.now_ns();
        let tat = self.tat_ns.load(Ordering::Acquire);
        let debt_ns = tat.saturating_sub(now);
        let free_ns = self.tolerance_ns.saturating_sub(debt_ns);
        (free_ns as f64 / self.interval_ns as f64).clamp(0.0, self.burst)
    }

    pub fn snapshot(&self) -> RateLimiterState {
        RateLimiterState {
            source_id: self.source_id.clone(),
            tokens: self.available(),
            refill_rate: self.refill_rate,
            burst: self.burst,
            last_refill_at: Utc::now(),
            grants: self.grants.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ns.load(Ordering::Relaxed) / 1_000_000,
        }
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("source_id", &self.source_id)
            .field("refill_rate", &self.refill_rate)
            .field("burst", &self.burst)
            .field("available", &self.available())
            .finish()
    }
}

// =============================================================================
// RateLimiter — registry of per-source buckets
// =============================================================================

/// Independent token buckets keyed by source id.
///
/// The map lock is only held to look up (or lazily create) a bucket; the
/// bucket itself is lock-free.
pub struct RateLimiter {
    buckets: RwLock<HashMap<SourceId, Arc<TokenBucket>>>,
    default_rate: f64,
    default_burst: f64,
}

impl RateLimiter {
    pub fn new(sources: &[SourceConfig], default_source: &SourceConfig) -> Self {
        let buckets = sources
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    Arc::new(TokenBucket::new(s.id.clone(), s.refill_rate, s.burst)),
                )
            })
            .collect();
        Self {
            buckets: RwLock::new(buckets),
            default_rate: default_source.refill_rate,
            default_burst: default_source.burst,
        }
    }

    fn bucket(&self, source_id: &str) -> Arc<TokenBucket> {
        if let Some(b) = self.buckets.read().get(source_id) {
            return b.clone();
        }
        self.buckets
            .write()
            .entry(source_id.to_string())
            .or_insert_with(|| {
                debug!(source = source_id, "rate limiter: creating default bucket");
                Arc::new(TokenBucket::new(
                    source_id,
                    self.default_rate,
                    self.default_burst,
                ))
            })
            .clone()
    }

    /// Wait until `cost` tokens are available for `source_id`, then take them.
    pub async fn acquire(&self, source_id: &str, cost: u32) -> Grant {
        let bucket = self.bucket(source_id);
        bucket.acquire(cost).await
    }

    pub fn snapshot(&self) -> Vec<RateLimiterState> {
        let mut states: Vec<_> = self.buckets.read().values().map(|b| b.snapshot()).collect();
        states.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        states
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("sources", &self.buckets.read().len())
            .finish()
    }
}
