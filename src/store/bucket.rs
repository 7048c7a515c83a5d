//! Token bucket and fixed-window counter state.

use std::time::Duration;

use tokio::time::Instant;

use super::RateLimitReq;

/// Fraction of nominal capacity and refill a bucket starts its warmup at.
pub const WARMUP_FLOOR: f64 = 0.1;

/// Scale applied to a bucket's capacity and refill rate `since_creation`
/// into a `warmup` ramp.
///
/// Rises linearly from [`WARMUP_FLOOR`] to 1 and stays at 1 once the ramp is
/// over. A zero warmup is always 1.
pub fn warmup_factor(since_creation: Duration, warmup: Duration) -> f64 {
    if warmup.is_zero() || since_creation >= warmup {
        return 1.0;
    }
    let progress = since_creation.as_secs_f64() / warmup.as_secs_f64();
    WARMUP_FLOOR + (1.0 - WARMUP_FLOOR) * progress
}

/// Why a bucket turned a request down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Blocked {
    /// Not enough tokens after refill
    Tokens { available: f64 },
    /// The key was charged less than `min_interval` ago
    TooSoon { elapsed: Duration },
}

/// State of one token bucket.
#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    created: Instant,
    last_charge: Option<Instant>,
}

impl TokenBucket {
    /// A new bucket, full at whatever capacity its warmup allows.
    pub(crate) fn new(req: &RateLimitReq, now: Instant) -> Self {
        Self {
            tokens: effective_capacity(req, Duration::ZERO),
            last_refill: now,
            created: now,
            last_charge: None,
        }
    }

    pub(crate) fn tokens(&self) -> f64 {
        self.tokens
    }

    /// `tokens = min(capacity, tokens + refill_rate * elapsed)`, both terms
    /// scaled by the warmup ramp.
    pub(crate) fn refill(&mut self, req: &RateLimitReq, now: Instant) {
        let since_creation = now.saturating_duration_since(self.created);
        let factor = warmup_factor(since_creation, req.warmup);
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();

        let refilled = self.tokens + req.refill_rate * factor * elapsed;
        self.tokens = refilled.min(effective_capacity(req, since_creation));
        self.last_refill = now;
    }

    /// Check a refilled bucket against `req` without charging it.
    pub(crate) fn check(&self, req: &RateLimitReq, now: Instant) -> Result<(), Blocked> {
        if !req.min_interval.is_zero() {
            if let Some(last) = self.last_charge {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < req.min_interval {
                    return Err(Blocked::TooSoon { elapsed });
                }
            }
        }
        if self.tokens < req.cost as f64 {
            return Err(Blocked::Tokens {
                available: self.tokens,
            });
        }
        Ok(())
    }

    pub(crate) fn charge(&mut self, cost: u64, now: Instant) {
        self.tokens -= cost as f64;
        self.last_charge = Some(now);
    }
}

/// Capacity under warmup, never below one token (or the nominal capacity,
/// if that is smaller) so a fresh bucket can admit at least a unit request.
fn effective_capacity(req: &RateLimitReq, since_creation: Duration) -> f64 {
    let capacity = req.capacity as f64;
    let scaled = capacity * warmup_factor(since_creation, req.warmup);
    scaled.max(capacity.min(1.0))
}

/// A fixed-window counter.
#[derive(Debug, Clone)]
pub(crate) struct WindowCounter {
    count: u64,
    expires_at: Instant,
}

impl WindowCounter {
    pub(crate) fn new(window: Duration, now: Instant) -> Self {
        Self {
            count: 0,
            expires_at: now + window,
        }
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Add `cost` and report whether the count is still within `limit`.
    pub(crate) fn increment(&mut self, cost: u64, limit: u64) -> bool {
        self.count = self.count.saturating_add(cost);
        self.count <= limit
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(capacity: u64, refill_rate: f64) -> RateLimitReq {
        RateLimitReq::new("bucket", capacity, refill_rate, 1)
    }

    #[test]
    fn test_warmup_factor_ramp() {
        let warmup = Duration::from_secs(10);
        assert_eq!(warmup_factor(Duration::ZERO, warmup), WARMUP_FLOOR);
        assert_eq!(warmup_factor(Duration::from_secs(10), warmup), 1.0);
        assert_eq!(warmup_factor(Duration::from_secs(60), warmup), 1.0);
        assert_eq!(warmup_factor(Duration::from_secs(3), Duration::ZERO), 1.0);

        let halfway = warmup_factor(Duration::from_secs(5), warmup);
        assert!((halfway - (WARMUP_FLOOR + (1.0 - WARMUP_FLOOR) * 0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_warmup_factor_is_monotonic() {
        let warmup = Duration::from_millis(1000);
        let mut previous = 0.0;
        for ms in (0..=1500).step_by(25) {
            let factor = warmup_factor(Duration::from_millis(ms), warmup);
            assert!(factor >= previous, "factor dropped at {ms}ms");
            assert!(factor <= 1.0);
            previous = factor;
        }
        assert_eq!(previous, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_refill_is_capped() {
        let req = req(10, 5.0);
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&req, start);
        assert_eq!(bucket.tokens(), 10.0);

        bucket.charge(8, start);
        assert_eq!(bucket.tokens(), 2.0);

        bucket.refill(&req, start + Duration::from_millis(1000));
        assert!((bucket.tokens() - 7.0).abs() < 1e-9);

        bucket.refill(&req, start + Duration::from_secs(30));
        assert_eq!(bucket.tokens(), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_check_tokens_and_interval() {
        let req = req(2, 0.0).with_min_interval(Duration::from_millis(100));
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&req, start);

        assert_eq!(bucket.check(&req, start), Ok(()));
        bucket.charge(1, start);

        let soon = start + Duration::from_millis(50);
        assert!(matches!(bucket.check(&req, soon), Err(Blocked::TooSoon { .. })));

        let later = start + Duration::from_millis(150);
        assert_eq!(bucket.check(&req, later), Ok(()));
        bucket.charge(1, later);

        let much_later = start + Duration::from_secs(5);
        bucket.refill(&req, much_later);
        assert!(matches!(
            bucket.check(&req, much_later),
            Err(Blocked::Tokens { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_bucket_under_warmup_starts_throttled() {
        let req = req(100, 100.0).with_warmup(Duration::from_secs(10));
        let start = Instant::now();
        let bucket = TokenBucket::new(&req, start);
        assert!((bucket.tokens() - 10.0).abs() < 1e-9);

        let small = RateLimitReq::new("small", 3, 1.0, 1).with_warmup(Duration::from_secs(10));
        let bucket = TokenBucket::new(&small, start);
        assert_eq!(bucket.tokens(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_counter() {
        let start = Instant::now();
        let mut counter = WindowCounter::new(Duration::from_secs(1), start);

        assert!(counter.increment(3, 5));
        assert!(counter.increment(2, 5));
        assert!(!counter.increment(1, 5));
        assert_eq!(counter.count(), 6);

        assert!(!counter.is_expired(start + Duration::from_millis(999)));
        assert!(counter.is_expired(start + Duration::from_secs(1)));
    }
}
