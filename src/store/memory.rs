//! In-process implementation of the state store contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::bucket::{Blocked, TokenBucket, WindowCounter};
use super::{RateLimitReq, StateStore, StoreError};

/// A state store held in process memory.
///
/// Token buckets share one table behind a single mutex: the atomic
/// multi-key check runs entirely inside that critical section, so concurrent
/// checks touching the same keys are serialized. Idempotency claims,
/// fixed-window counters and smoothing stamps are independent per key and
/// live in `DashMap`s.
#[derive(Default)]
pub struct MemoryStore {
    /// Token buckets indexed by key
    buckets: Mutex<HashMap<String, TokenBucket>>,
    /// Fixed-window counters indexed by key
    windows: DashMap<String, WindowCounter>,
    /// Idempotency claims: job id -> claim expiry
    claims: DashMap<String, Instant>,
    /// Burst smoothing: key -> end of the blocked interval
    smoothing: DashMap<String, Instant>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate and charge `reqs` inside the bucket critical section.
    fn evaluate(&self, reqs: &[RateLimitReq]) -> Result<bool, StoreError> {
        for req in reqs {
            req.validate()?;
        }
        let pooled = pool_by_key(reqs);
        let now = Instant::now();

        let mut buckets = self.buckets.lock();

        // Refill (or create) every bucket first. Refilling is not a charge
        // and yields the same tokens whether or not it is persisted.
        for req in &pooled {
            buckets
                .entry(req.key.clone())
                .or_insert_with(|| {
                    debug!(key = %req.key, capacity = req.capacity, "Creating token bucket");
                    TokenBucket::new(req, now)
                })
                .refill(req, now);
        }

        for req in &pooled {
            let Some(bucket) = buckets.get(&req.key) else {
                continue;
            };
            if let Err(blocked) = bucket.check(req, now) {
                match blocked {
                    Blocked::Tokens { available } => trace!(
                        key = %req.key,
                        cost = req.cost,
                        available,
                        "Bucket has insufficient tokens"
                    ),
                    Blocked::TooSoon { elapsed } => trace!(
                        key = %req.key,
                        elapsed = ?elapsed,
                        min_interval = ?req.min_interval,
                        "Bucket charged too recently"
                    ),
                }
                return Ok(false);
            }
        }

        for req in &pooled {
            if let Some(bucket) = buckets.get_mut(&req.key) {
                bucket.charge(req.cost, now);
            }
        }
        Ok(true)
    }

    /// Get the stored token count of a bucket, without refilling it.
    ///
    /// Returns `None` if no bucket exists for the key.
    pub fn bucket_tokens(&self, key: &str) -> Option<f64> {
        self.buckets.lock().get(key).map(TokenBucket::tokens)
    }

    /// Get the number of token buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Whether `job_id` currently holds an unexpired idempotency claim.
    pub fn is_claimed(&self, job_id: &str) -> bool {
        self.claims
            .get(job_id)
            .is_some_and(|expires_at| Instant::now() < *expires_at)
    }

    /// Get the number of idempotency claims held, expired or not.
    pub fn claim_count(&self) -> usize {
        self.claims.len()
    }

    /// Drop expired claims, fixed windows and smoothing stamps, returning
    /// how many entries were removed.
    ///
    /// Expired entries already read as absent; this only reclaims memory.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.claims.len() + self.windows.len() + self.smoothing.len();
        self.claims.retain(|_, expires_at| now < *expires_at);
        self.windows.retain(|_, counter| !counter.is_expired(now));
        self.smoothing.retain(|_, blocked_until| now < *blocked_until);
        let after = self.claims.len() + self.windows.len() + self.smoothing.len();
        before.saturating_sub(after)
    }

    /// Purge expired entries every `interval` until `shutdown` turns true.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.purge_expired();
                        if removed > 0 {
                            debug!(removed, "Purged expired store entries");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Get the current count of a fixed-window counter.
    pub fn window_count(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.windows
            .get(key)
            .filter(|counter| !counter.is_expired(now))
            .map(|counter| counter.count())
    }
}

/// Fold requests that share a key into one request with the summed cost.
///
/// The first occurrence of a key supplies the bucket parameters; order of
/// first appearance is preserved.
fn pool_by_key(reqs: &[RateLimitReq]) -> Vec<RateLimitReq> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(reqs.len());
    let mut pooled: Vec<RateLimitReq> = Vec::with_capacity(reqs.len());

    for req in reqs {
        match index.get(req.key.as_str()) {
            Some(&i) => pooled[i].cost = pooled[i].cost.saturating_add(req.cost),
            None => {
                index.insert(req.key.as_str(), pooled.len());
                pooled.push(req.clone());
            }
        }
    }
    pooled
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn check_and_mark_admitted(
        &self,
        job_id: &str,
        window: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.claims.entry(job_id.to_string()) {
            Entry::Occupied(mut claim) => {
                if now < *claim.get() {
                    return Ok(true);
                }
                claim.insert(now + window);
                Ok(false)
            }
            Entry::Vacant(slot) => {
                slot.insert(now + window);
                Ok(false)
            }
        }
    }

    async fn allow_request(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        cost: u64,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut counter = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter::new(window, now));
        if counter.is_expired(now) {
            *counter = WindowCounter::new(window, now);
        }
        Ok(counter.increment(cost, limit))
    }

    async fn allow_request_token_bucket(
        &self,
        key: &str,
        capacity: u64,
        refill_rate: f64,
        cost: u64,
    ) -> Result<bool, StoreError> {
        self.evaluate(&[RateLimitReq::new(key, capacity, refill_rate, cost)])
    }

    async fn allow_request_atomic(&self, reqs: &[RateLimitReq]) -> Result<bool, StoreError> {
        if reqs.is_empty() {
            return Ok(true);
        }
        self.evaluate(reqs)
    }

    async fn allow_burst_smoothing(
        &self,
        key: &str,
        min_interval: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.smoothing.entry(key.to_string()) {
            Entry::Occupied(mut blocked_until) => {
                if now < *blocked_until.get() {
                    return Ok(false);
                }
                blocked_until.insert(now + min_interval);
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(now + min_interval);
                Ok(true)
            }
        }
    }

    async fn clear_idempotency(&self, job_id: &str) -> Result<(), StoreError> {
        self.claims.remove(job_id);
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.buckets.lock().clear();
        self.windows.clear();
        self.claims.clear();
        self.smoothing.clear();
        debug!("Flushed all quota and idempotency state");
        Ok(())
    }
}
