//! Shared-state store contract consumed by the admission controller.
//!
//! Every operation here is atomic on its own. `allow_request_atomic` is the
//! only synchronization primitive the controller relies on: it evaluates and
//! charges a whole set of token buckets as one indivisible step.

mod bucket;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use bucket::{warmup_factor, WARMUP_FLOOR};
pub use memory::MemoryStore;

/// Errors surfaced by a state store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The caller's deadline elapsed before the store answered
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// A rate-limit request violated the bucket contract
    #[error("invalid rate limit request: {0}")]
    InvalidRequest(String),

    /// The store accepted the call but failed to execute it
    #[error("store operation failed: {0}")]
    Operation(String),
}

/// One bucket charge submitted to the atomic multi-key check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitReq {
    /// Bucket key
    pub key: String,
    /// Bucket capacity in tokens, must be positive
    pub capacity: u64,
    /// Tokens added per second, must be non-negative
    pub refill_rate: f64,
    /// Tokens this request consumes
    pub cost: u64,
    /// Minimum spacing since the key's last successful charge
    pub min_interval: Duration,
    /// Ramp period after the bucket is created
    pub warmup: Duration,
}

impl RateLimitReq {
    /// A plain token bucket request with no smoothing or warmup.
    pub fn new(key: impl Into<String>, capacity: u64, refill_rate: f64, cost: u64) -> Self {
        Self {
            key: key.into(),
            capacity,
            refill_rate,
            cost,
            min_interval: Duration::ZERO,
            warmup: Duration::ZERO,
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    /// Check the bucket contract: a key, positive capacity and a finite,
    /// non-negative refill rate.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.key.is_empty() {
            return Err(StoreError::InvalidRequest("empty key".into()));
        }
        if self.capacity == 0 {
            return Err(StoreError::InvalidRequest(format!(
                "bucket '{}' has zero capacity",
                self.key
            )));
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(StoreError::InvalidRequest(format!(
                "bucket '{}' has refill rate {}",
                self.key, self.refill_rate
            )));
        }
        Ok(())
    }
}

/// Capability set of the shared store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Claim `job_id` for `window` if nobody holds it.
    ///
    /// Returns `true` when the id was already claimed (a duplicate) and
    /// `false` when this call took the claim.
    async fn check_and_mark_admitted(
        &self,
        job_id: &str,
        window: Duration,
    ) -> Result<bool, StoreError>;

    /// Fixed-window counter: add `cost`, start the window on the first
    /// increment, reject once the count exceeds `limit`.
    async fn allow_request(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        cost: u64,
    ) -> Result<bool, StoreError>;

    /// Single-key token bucket.
    async fn allow_request_token_bucket(
        &self,
        key: &str,
        capacity: u64,
        refill_rate: f64,
        cost: u64,
    ) -> Result<bool, StoreError>;

    /// Evaluate and charge every request as one indivisible step.
    ///
    /// Returns `true` when every bucket was charged, `false` when any request
    /// failed its token or min-interval check, in which case no bucket is
    /// charged.
    async fn allow_request_atomic(&self, reqs: &[RateLimitReq]) -> Result<bool, StoreError>;

    /// Single-key burst smoothing gate.
    async fn allow_burst_smoothing(
        &self,
        key: &str,
        min_interval: Duration,
    ) -> Result<bool, StoreError>;

    /// Release an idempotency claim.
    async fn clear_idempotency(&self, job_id: &str) -> Result<(), StoreError>;

    /// Drop every quota and idempotency record.
    async fn flush(&self) -> Result<(), StoreError>;
}
