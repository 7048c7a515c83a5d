//! The admission controller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::decision::{Decision, Reason};
use super::job::Job;
use super::requests::build_requests;
use super::stats::{AdmissionStats, StatsSnapshot};
use crate::policy::{resolve_effective_policy, Policy, PolicyHandle};
use crate::store::{StateStore, StoreError};

/// Default deadline for a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Renders accept/reject decisions for jobs against the active policy.
///
/// The controller holds no per-job lock. Concurrent checks are serialized
/// only by the store's atomic multi-key operation.
pub struct AdmissionController<S: StateStore> {
    /// The publish point for the active policy
    policy: Arc<PolicyHandle>,
    /// Shared quota and idempotency state
    store: Arc<S>,
    stats: AdmissionStats,
    /// Deadline applied to every store call
    store_timeout: Duration,
}

/// A job that passed the stateless and idempotency gates.
struct Cleared {
    policy: Arc<Policy>,
    /// Whether this check took an idempotency claim it may need to release
    claimed: bool,
    config: Option<Value>,
}

enum Gate {
    Cleared(Cleared),
    Rejected {
        reason: Reason,
        config: Option<Value>,
    },
}

impl<S: StateStore> AdmissionController<S> {
    /// Create a controller over `policy` and `store`.
    pub fn new(policy: Arc<PolicyHandle>, store: Arc<S>) -> Self {
        Self {
            policy,
            store,
            stats: AdmissionStats::new(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Set the deadline applied to each store round trip.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Get the policy publish point.
    pub fn policy(&self) -> &Arc<PolicyHandle> {
        &self.policy
    }

    /// Get the backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get a snapshot of the admission statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Decide whether a single job is admitted.
    ///
    /// Every path ends in a [`Decision`]; store failures become
    /// `store_error` rejections.
    #[instrument(skip(self, job), fields(job_id = %job.job_id, tenant_id = %job.tenant_id))]
    pub async fn check(&self, job: Job) -> Decision {
        let default = self.policy.current();
        let decision = match self.run_gates(&job, &default).await {
            Gate::Rejected { reason, config } => Decision::rejected(job, reason, config),
            Gate::Cleared(cleared) => {
                let reqs = build_requests(&job, &cleared.policy);
                match self.call(self.store.allow_request_atomic(&reqs)).await {
                    Ok(true) => Decision::accepted(job, cleared.config),
                    Ok(false) => {
                        self.release_claim(&job.job_id, cleared.claimed).await;
                        Decision::rejected(job, Reason::RateLimitExceeded, cleared.config)
                    }
                    Err(e) => {
                        warn!(error = %e, "Quota check failed");
                        self.release_claim(&job.job_id, cleared.claimed).await;
                        Decision::rejected(job, Reason::StoreError, cleared.config)
                    }
                }
            }
        };

        self.record(&decision);
        decision
    }

    /// Check jobs one after another.
    ///
    /// Each job is admitted or rejected on its own as quota is consumed, so
    /// a batch that outruns its quota admits a prefix.
    #[instrument(skip(self, jobs), fields(batch_size = jobs.len()))]
    pub async fn check_batch(&self, jobs: Vec<Job>) -> Vec<Decision> {
        let mut decisions = Vec::with_capacity(jobs.len());
        for job in jobs {
            decisions.push(self.check(job).await);
        }
        decisions
    }

    /// Check a batch all-or-nothing.
    ///
    /// Jobs first pass the priority and idempotency gates on their own; the
    /// quota requests of every survivor are then pooled into one atomic
    /// check. Either every survivor is accepted or every survivor is
    /// rejected and its idempotency claim released. The whole batch runs
    /// under one policy snapshot.
    #[instrument(skip(self, jobs), fields(batch_size = jobs.len()))]
    pub async fn check_batch_atomic(&self, jobs: Vec<Job>) -> Vec<Decision> {
        let default = self.policy.current();
        let gates = join_all(jobs.iter().map(|job| self.run_gates(job, &default))).await;

        let mut reqs = Vec::new();
        let mut survivors = Vec::new();
        for (job, gate) in jobs.iter().zip(&gates) {
            if let Gate::Cleared(cleared) = gate {
                reqs.extend(build_requests(job, &cleared.policy));
                survivors.push((job.job_id.as_str(), cleared.claimed));
            }
        }

        let failure = if survivors.is_empty() {
            None
        } else {
            match self.call(self.store.allow_request_atomic(&reqs)).await {
                Ok(true) => None,
                Ok(false) => Some(Reason::BatchQuotaExceeded),
                Err(e) => {
                    warn!(error = %e, "Pooled quota check failed");
                    Some(Reason::StoreError)
                }
            }
        };

        if failure.is_some() {
            join_all(
                survivors
                    .iter()
                    .map(|(job_id, claimed)| self.release_claim(job_id, *claimed)),
            )
            .await;
        }
        let survivor_count = survivors.len();
        drop(survivors);

        let decisions: Vec<Decision> = jobs
            .into_iter()
            .zip(gates)
            .map(|(job, gate)| match gate {
                Gate::Rejected { reason, config } => Decision::rejected(job, reason, config),
                Gate::Cleared(cleared) => match failure {
                    None => Decision::accepted(job, cleared.config),
                    Some(reason) => Decision::rejected(job, reason, cleared.config),
                },
            })
            .collect();

        for decision in &decisions {
            self.record(decision);
        }
        info!(
            survivors = survivor_count,
            outcome = ?failure.unwrap_or(Reason::Admitted),
            "Atomic batch decided"
        );
        decisions
    }

    /// Resolve the effective policy and run the priority and idempotency
    /// gates. Touches no quota.
    async fn run_gates(&self, job: &Job, default: &Arc<Policy>) -> Gate {
        let policy = match resolve_effective_policy(job, default) {
            Ok(policy) => policy,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Embedded config rejected");
                return Gate::Rejected {
                    reason: Reason::InvalidConfig,
                    config: job.meta.config.clone(),
                };
            }
        };
        let config = decision_config(job, &policy);

        let min_priority = policy.global_execution_limit.min_priority;
        if job.priority < min_priority {
            debug!(
                job_id = %job.job_id,
                priority = job.priority,
                min_priority,
                "Priority below gate"
            );
            return Gate::Rejected {
                reason: Reason::PriorityTooLow,
                config,
            };
        }

        let Some(window) = policy.default_job_policy.idempotency_window() else {
            return Gate::Cleared(Cleared {
                policy,
                claimed: false,
                config,
            });
        };

        match self
            .call(self.store.check_and_mark_admitted(&job.job_id, window))
            .await
        {
            Ok(false) => Gate::Cleared(Cleared {
                policy,
                claimed: true,
                config,
            }),
            Ok(true) => {
                debug!(job_id = %job.job_id, window = ?window, "Duplicate submission");
                Gate::Rejected {
                    reason: Reason::DuplicateRequest,
                    config,
                }
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Idempotency claim failed");
                // A timed-out claim may still have landed.
                if matches!(e, StoreError::Timeout(_)) {
                    self.release_claim(&job.job_id, true).await;
                }
                Gate::Rejected {
                    reason: Reason::StoreError,
                    config,
                }
            }
        }
    }

    /// Best-effort release of an idempotency claim taken by this check.
    async fn release_claim(&self, job_id: &str, claimed: bool) {
        if !claimed {
            return;
        }
        if let Err(e) = self.call(self.store.clear_idempotency(job_id)).await {
            warn!(job_id = %job_id, error = %e, "Failed to release idempotency claim");
        }
    }

    /// Run a store call under the controller's deadline.
    async fn call<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }

    fn record(&self, decision: &Decision) {
        self.stats.record(decision);
        info!(
            job_id = %decision.job_id,
            status = ?decision.status,
            reason = %decision.reason,
            "Admission decision"
        );
    }
}

/// The policy document recorded on a decision: the job's embedded override
/// if it has one, the controller's policy otherwise.
fn decision_config(job: &Job, policy: &Policy) -> Option<Value> {
    match &job.meta.config {
        Some(raw) => Some(raw.clone()),
        None => serde_json::to_value(policy).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::requests::{dependency_key, tenant_key, GLOBAL_KEY};
    use crate::admission::DecisionStatus;
    use crate::policy::parse_policy;
    use crate::store::{MemoryStore, RateLimitReq};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Wraps a `MemoryStore` and fails or stalls the atomic check on demand.
    #[derive(Default)]
    struct FaultyStore {
        inner: MemoryStore,
        fail_atomic: AtomicBool,
        stall_atomic: AtomicBool,
        fail_claims: AtomicBool,
        /// Published into the handle by the next idempotency claim
        publish_on_claim: parking_lot::Mutex<Option<(Arc<PolicyHandle>, Policy)>>,
    }

    #[async_trait]
    impl StateStore for FaultyStore {
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }

        async fn check_and_mark_admitted(
            &self,
            job_id: &str,
            window: Duration,
        ) -> Result<bool, StoreError> {
            if self.fail_claims.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            if let Some((handle, policy)) = self.publish_on_claim.lock().take() {
                handle.publish(policy);
            }
            self.inner.check_and_mark_admitted(job_id, window).await
        }

        async fn allow_request(
            &self,
            key: &str,
            limit: u64,
            window: Duration,
            cost: u64,
        ) -> Result<bool, StoreError> {
            self.inner.allow_request(key, limit, window, cost).await
        }

        async fn allow_request_token_bucket(
            &self,
            key: &str,
            capacity: u64,
            refill_rate: f64,
            cost: u64,
        ) -> Result<bool, StoreError> {
            self.inner
                .allow_request_token_bucket(key, capacity, refill_rate, cost)
                .await
        }

        async fn allow_request_atomic(&self, reqs: &[RateLimitReq]) -> Result<bool, StoreError> {
            if self.stall_atomic.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail_atomic.load(Ordering::SeqCst) {
                return Err(StoreError::Operation("script error".into()));
            }
            self.inner.allow_request_atomic(reqs).await
        }

        async fn allow_burst_smoothing(
            &self,
            key: &str,
            min_interval: Duration,
        ) -> Result<bool, StoreError> {
            self.inner.allow_burst_smoothing(key, min_interval).await
        }

        async fn clear_idempotency(&self, job_id: &str) -> Result<(), StoreError> {
            self.inner.clear_idempotency(job_id).await
        }

        async fn flush(&self) -> Result<(), StoreError> {
            self.inner.flush().await
        }
    }

    fn policy_json(max_jobs: i64, per_tenant: i64, min_priority: i64) -> Value {
        json!({
            "version": 1,
            "global_execution_limit": {
                "max_jobs": max_jobs,
                "window_ms": 1000,
                "max_concurrent_per_tenant": per_tenant,
                "min_priority": min_priority,
                "min_interval_ms": 0
            },
            "dependencies": {
                "payments": {
                    "type": "external_api",
                    "rate_limit": {"max_requests": 3, "window_ms": 1000}
                },
                "ledger": {"type": "database", "concurrent": {"max_inflight": 1}}
            },
            "default_job_policy": {"idempotency_window_ms": 60000}
        })
    }

    fn controller_with<S: StateStore>(
        store: Arc<S>,
        max_jobs: i64,
        per_tenant: i64,
        min_priority: i64,
    ) -> AdmissionController<S> {
        let policy = parse_policy(&policy_json(max_jobs, per_tenant, min_priority).to_string())
            .unwrap();
        AdmissionController::new(Arc::new(PolicyHandle::new(policy)), store)
    }

    fn controller(
        max_jobs: i64,
        per_tenant: i64,
        min_priority: i64,
    ) -> AdmissionController<MemoryStore> {
        controller_with(Arc::new(MemoryStore::new()), max_jobs, per_tenant, min_priority)
    }

    fn reasons(decisions: &[Decision]) -> Vec<Reason> {
        decisions.iter().map(|d| d.reason).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_cap_admits_at_most_n() {
        let ac = controller(5, 100, 0);

        for i in 0..5 {
            let decision = ac.check(Job::new(format!("job-{i}"), "acme", 1)).await;
            assert!(decision.is_accepted(), "job-{i} should be admitted");
        }

        let decision = ac.check(Job::new("job-5", "acme", 1)).await;
        assert_eq!(decision.status, DecisionStatus::Rejected);
        assert_eq!(decision.reason, Reason::RateLimitExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenant_quota_is_per_tenant() {
        let ac = controller(100, 2, 0);

        assert!(ac.check(Job::new("a1", "acme", 0)).await.is_accepted());
        assert!(ac.check(Job::new("a2", "acme", 0)).await.is_accepted());
        let third = ac.check(Job::new("a3", "acme", 0)).await;
        assert_eq!(third.reason, Reason::RateLimitExceeded);

        assert!(ac.check(Job::new("b1", "globex", 0)).await.is_accepted());
        assert_eq!(ac.store().bucket_tokens(&tenant_key("acme")), Some(0.0));
        assert_eq!(ac.store().bucket_tokens(GLOBAL_KEY), Some(97.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_window_and_after() {
        let ac = controller(100, 100, 0);

        assert!(ac.check(Job::new("job-1", "acme", 1)).await.is_accepted());
        let dup = ac.check(Job::new("job-1", "acme", 1)).await;
        assert_eq!(dup.reason, Reason::DuplicateRequest);

        tokio::time::advance(Duration::from_millis(60_001)).await;
        assert!(ac.check(Job::new("job-1", "acme", 1)).await.is_accepted());
    }

    #[tokio::test]
    async fn test_priority_gate_has_no_side_effects() {
        let ac = controller(10, 10, 3);

        let decision = ac.check(Job::new("low", "acme", 2)).await;
        assert_eq!(decision.reason, Reason::PriorityTooLow);
        assert_eq!(ac.store().bucket_count(), 0);
        assert!(!ac.store().is_claimed("low"));

        assert!(ac.check(Job::new("ok", "acme", 3)).await.is_accepted());
        let tokens_before = ac.store().bucket_tokens(GLOBAL_KEY);

        let decision = ac.check(Job::new("low-again", "acme", -1)).await;
        assert_eq!(decision.reason, Reason::PriorityTooLow);
        assert_eq!(ac.store().bucket_tokens(GLOBAL_KEY), tokens_before);
        assert!(!ac.store().is_claimed("low-again"));
    }

    #[tokio::test]
    async fn test_rate_limit_rejection_releases_claim() {
        let ac = controller(1, 10, 0);

        assert!(ac.check(Job::new("first", "acme", 0)).await.is_accepted());
        let rejected = ac.check(Job::new("second", "acme", 0)).await;
        assert_eq!(rejected.reason, Reason::RateLimitExceeded);
        assert!(!ac.store().is_claimed("second"));
        assert!(ac.store().is_claimed("first"));
    }

    #[tokio::test]
    async fn test_store_error_releases_claim() {
        let store = Arc::new(FaultyStore::default());
        let ac = controller_with(Arc::clone(&store), 10, 10, 0);

        store.fail_atomic.store(true, Ordering::SeqCst);
        let decision = ac.check(Job::new("job-1", "acme", 0)).await;
        assert_eq!(decision.reason, Reason::StoreError);
        assert!(!store.inner.is_claimed("job-1"));

        store.fail_atomic.store(false, Ordering::SeqCst);
        let retry = ac.check(Job::new("job-1", "acme", 0)).await;
        assert!(retry.is_accepted());
    }

    #[tokio::test]
    async fn test_claim_failure_is_store_error() {
        let store = Arc::new(FaultyStore::default());
        let ac = controller_with(Arc::clone(&store), 10, 10, 0);

        store.fail_claims.store(true, Ordering::SeqCst);
        let decision = ac.check(Job::new("job-1", "acme", 0)).await;
        assert_eq!(decision.reason, Reason::StoreError);
        assert_eq!(store.inner.bucket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_deadline_releases_claim() {
        let store = Arc::new(FaultyStore::default());
        let ac = controller_with(Arc::clone(&store), 10, 10, 0)
            .with_store_timeout(Duration::from_millis(100));

        store.stall_atomic.store(true, Ordering::SeqCst);
        let decision = ac.check(Job::new("job-1", "acme", 0)).await;
        assert_eq!(decision.reason, Reason::StoreError);
        assert!(!store.inner.is_claimed("job-1"));
    }

    #[tokio::test]
    async fn test_invalid_embedded_config_touches_nothing() {
        let ac = controller(10, 10, 0);

        let mut bad = policy_json(10, 10, 0);
        bad["global_execution_limit"]["window_ms"] = json!(0);
        let job = Job::new("job-1", "acme", 0).with_config(bad.clone(), "cfg-1");

        let decision = ac.check(job).await;
        assert_eq!(decision.reason, Reason::InvalidConfig);
        assert_eq!(decision.config, Some(bad));
        assert_eq!(ac.store().bucket_count(), 0);
        assert!(!ac.store().is_claimed("job-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_embedded_config_overrides_default() {
        let ac = controller(100, 100, 0);
        let strict = policy_json(100, 100, 10);

        let job = Job::new("job-1", "acme", 5).with_config(strict.clone(), "cfg-strict");
        let decision = ac.check(job).await;
        assert_eq!(decision.reason, Reason::PriorityTooLow);
        assert_eq!(decision.config, Some(strict));

        let decision = ac.check(Job::new("job-2", "acme", 5)).await;
        assert!(decision.is_accepted());
        assert_eq!(decision.config.unwrap()["version"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_quota() {
        let ac = controller(100, 100, 0);

        let job = |id: &str, cost| {
            Job::new(id, "acme", 0)
                .with_dependency("payments", cost)
                .with_dependency("ledger", 5)
        };

        assert!(ac.check(job("job-1", 2)).await.is_accepted());
        let over = ac.check(job("job-2", 2)).await;
        assert_eq!(over.reason, Reason::RateLimitExceeded);
        assert!(ac.check(job("job-3", 1)).await.is_accepted());

        assert_eq!(ac.store().bucket_tokens(&dependency_key("payments")), Some(0.0));
        assert_eq!(ac.store().bucket_tokens(&dependency_key("ledger")), None);
        assert_eq!(ac.store().bucket_tokens(GLOBAL_KEY), Some(98.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_duplicate_then_cap() {
        let ac = controller(2, 100, 0);

        let a = ac.check(Job::new("A", "acme", 5)).await;
        assert_eq!(a.reason, Reason::Admitted);
        let again = ac.check(Job::new("A", "acme", 5)).await;
        assert_eq!(again.reason, Reason::DuplicateRequest);
        let b = ac.check(Job::new("B", "acme", 5)).await;
        assert_eq!(b.reason, Reason::Admitted);
        let c = ac.check(Job::new("C", "acme", 5)).await;
        assert_eq!(c.reason, Reason::RateLimitExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_atomic_batch_is_all_or_nothing() {
        let jobs = || (0..4).map(|i| Job::new(format!("job-{i}"), "acme", 1)).collect();

        let atomic = controller(3, 100, 0);
        let decisions = atomic.check_batch_atomic(jobs()).await;
        assert_eq!(decisions.len(), 4);
        assert!(decisions.iter().all(|d| d.reason == Reason::BatchQuotaExceeded));
        assert_eq!(atomic.store().bucket_tokens(GLOBAL_KEY), Some(3.0));
        for i in 0..4 {
            assert!(!atomic.store().is_claimed(&format!("job-{i}")));
        }

        let sequential = controller(3, 100, 0);
        let decisions = sequential.check_batch(jobs()).await;
        assert_eq!(
            reasons(&decisions),
            vec![
                Reason::Admitted,
                Reason::Admitted,
                Reason::Admitted,
                Reason::RateLimitExceeded
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_atomic_batch_accepts_when_pool_fits() {
        let ac = controller(3, 100, 0);
        let jobs = (0..3).map(|i| Job::new(format!("job-{i}"), "acme", 1)).collect();

        let decisions = ac.check_batch_atomic(jobs).await;
        assert!(decisions.iter().all(Decision::is_accepted));
        assert_eq!(ac.store().bucket_tokens(GLOBAL_KEY), Some(0.0));
        assert_eq!(ac.store().bucket_tokens(&tenant_key("acme")), Some(97.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_atomic_batch_phase_a_rejections_are_individual() {
        let ac = controller(2, 100, 1);
        assert!(ac.check(Job::new("seen", "acme", 1)).await.is_accepted());

        let jobs = vec![
            Job::new("low", "acme", 0),
            Job::new("seen", "acme", 1),
            Job::new("fresh", "acme", 1),
            Job::new("fresh", "acme", 1),
        ];
        let decisions = ac.check_batch_atomic(jobs).await;

        assert_eq!(decisions[0].reason, Reason::PriorityTooLow);
        assert_eq!(decisions[1].reason, Reason::DuplicateRequest);
        let fresh: Vec<Reason> = reasons(&decisions[2..]);
        assert!(fresh.contains(&Reason::Admitted));
        assert!(fresh.contains(&Reason::DuplicateRequest));
        assert_eq!(ac.store().bucket_tokens(GLOBAL_KEY), Some(0.0));
    }

    #[tokio::test]
    async fn test_atomic_batch_store_error_releases_every_claim() {
        let store = Arc::new(FaultyStore::default());
        let ac = controller_with(Arc::clone(&store), 10, 10, 1);
        store.fail_atomic.store(true, Ordering::SeqCst);

        let jobs = vec![
            Job::new("job-1", "acme", 1),
            Job::new("job-2", "acme", 1),
            Job::new("low", "acme", 0),
        ];
        let decisions = ac.check_batch_atomic(jobs).await;

        assert_eq!(
            reasons(&decisions),
            vec![Reason::StoreError, Reason::StoreError, Reason::PriorityTooLow]
        );
        assert!(!store.inner.is_claimed("job-1"));
        assert!(!store.inner.is_claimed("job-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_atomic_batch_uses_one_policy_snapshot() {
        let store = Arc::new(FaultyStore::default());
        let ac = controller_with(Arc::clone(&store), 10, 10, 0);
        let strict = parse_policy(&policy_json(10, 10, 50).to_string()).unwrap();
        *store.publish_on_claim.lock() = Some((Arc::clone(ac.policy()), strict));

        let decisions = ac
            .check_batch_atomic(vec![Job::new("a", "acme", 1), Job::new("b", "acme", 1)])
            .await;

        assert!(decisions.iter().all(Decision::is_accepted));
        assert_eq!(ac.policy().current().global_execution_limit.min_priority, 50);

        let next = ac.check(Job::new("c", "acme", 1)).await;
        assert_eq!(next.reason, Reason::PriorityTooLow);
    }

    #[tokio::test]
    async fn test_atomic_batch_without_survivors_skips_store() {
        let ac = controller(10, 10, 5);
        let decisions = ac
            .check_batch_atomic(vec![Job::new("a", "acme", 0), Job::new("b", "acme", 1)])
            .await;

        assert!(decisions.iter().all(|d| d.reason == Reason::PriorityTooLow));
        assert_eq!(ac.store().bucket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_published_policy_applies_to_next_check() {
        let ac = controller(100, 100, 0);
        assert!(ac.check(Job::new("job-1", "acme", 0)).await.is_accepted());

        let strict = parse_policy(&policy_json(100, 100, 50).to_string()).unwrap();
        ac.policy().publish(strict);

        let decision = ac.check(Job::new("job-2", "acme", 0)).await;
        assert_eq!(decision.reason, Reason::PriorityTooLow);
    }

    #[tokio::test]
    async fn test_stats_follow_decisions() {
        let ac = controller(1, 10, 0);
        ac.check(Job::new("a", "acme", 0)).await;
        ac.check(Job::new("b", "acme", 0)).await;

        let stats = ac.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.admitted_requests, 1);
        assert_eq!(stats.rejection_reasons[&Reason::RateLimitExceeded], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_checks_never_over_admit() {
        let ac = Arc::new(controller(10, 100, 0));
        let mut handles = Vec::new();
        for i in 0..40 {
            let ac = Arc::clone(&ac);
            handles.push(tokio::spawn(async move {
                ac.check(Job::new(format!("job-{i}"), format!("tenant-{}", i % 4), 0))
                    .await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_accepted() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}
