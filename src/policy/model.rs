//! Policy record types.
//!
//! Field names follow the JSON policy documents submitters store and embed
//! into jobs. Integer fields are signed so that negative values survive
//! deserialization and can be reported by validation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// The only policy version this build understands.
pub const SUPPORTED_POLICY_VERSION: u32 = 1;

/// Refill window used when a limit declares `window_ms = 0`.
pub(crate) const FALLBACK_WINDOW_MS: i64 = 1000;

/// A complete, versioned admission policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Policy format version
    pub version: u32,
    /// Global throughput cap, per-tenant quota and the priority gate
    #[serde(default)]
    pub global_execution_limit: GlobalExecutionLimit,
    /// Per-dependency limits keyed by dependency name
    #[serde(default)]
    pub dependencies: HashMap<String, DependencyPolicy>,
    /// Defaults applied to every job
    #[serde(default)]
    pub default_job_policy: JobPolicy,
}

/// Global limits shared by every job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalExecutionLimit {
    /// Bucket capacity of the global throughput cap
    pub max_jobs: i64,
    /// Window over which `max_jobs` refills
    pub window_ms: i64,
    /// Bucket capacity of each tenant's quota
    pub max_concurrent_per_tenant: i64,
    /// Jobs below this priority are rejected outright
    pub min_priority: i64,
    /// Minimum spacing between successive charges of the global bucket
    pub min_interval_ms: i64,
}

/// Kind of downstream a dependency represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    ExternalApi,
    InternalService,
    Database,
    #[serde(other)]
    Other,
}

/// Per-dependency limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyPolicy {
    /// Dependency kind
    #[serde(rename = "type")]
    pub kind: DependencyType,
    /// Token bucket limit charged with the job's declared cost
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    /// Declared in-flight cap; parsed and validated but not enforced
    #[serde(default, rename = "concurrent")]
    pub concurrency: Option<Concurrency>,
    /// Minimum spacing between successive charges to this dependency
    #[serde(default)]
    pub min_interval_ms: i64,
    /// Ramp period after the dependency bucket is created
    #[serde(default)]
    pub warmup_ms: i64,
}

/// A request budget over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: i64,
    pub window_ms: i64,
}

/// An in-flight cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concurrency {
    pub max_inflight: i64,
}

/// Job-level defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPolicy {
    /// Default dependency costs
    pub dependencies: HashMap<String, i64>,
    /// How long a job id stays claimed after admission
    pub idempotency_window_ms: i64,
    pub scope_limits: HashMap<String, i64>,
    pub scope_keys: Vec<String>,
    pub retry: RetryPolicy,
    pub execution: ExecutionPolicy,
    /// Reserved for a failure-feedback loop; validated only
    pub quarantine: Option<QuarantinePolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: i64,
    pub backoff: String,
    pub initial_delay_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPolicy {
    pub timeout_ms: i64,
}

/// Strike-based quarantine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinePolicy {
    /// Failures before a job is quarantined
    pub failure_threshold: i64,
    /// How long a quarantine lasts
    pub quarantine_duration_ms: i64,
    /// Window over which failures are counted
    pub monitoring_window_ms: i64,
}

impl GlobalExecutionLimit {
    /// Refill rate in tokens per second for a bucket of `capacity` over the
    /// global window.
    pub fn refill_rate(&self, capacity: i64) -> f64 {
        refill_rate(capacity, self.window_ms)
    }

    /// Minimum spacing between charges, zero when disabled.
    pub fn min_interval(&self) -> Duration {
        millis(self.min_interval_ms)
    }
}

impl RateLimit {
    /// Refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        refill_rate(self.max_requests, self.window_ms)
    }
}

impl DependencyPolicy {
    pub fn min_interval(&self) -> Duration {
        millis(self.min_interval_ms)
    }

    pub fn warmup(&self) -> Duration {
        millis(self.warmup_ms)
    }
}

impl JobPolicy {
    /// The idempotency window, `None` when the gate is disabled.
    pub fn idempotency_window(&self) -> Option<Duration> {
        (self.idempotency_window_ms > 0).then(|| millis(self.idempotency_window_ms))
    }
}

/// `capacity / (window_ms / 1000)`, with a zero window treated as one second.
fn refill_rate(capacity: i64, window_ms: i64) -> f64 {
    let window_ms = if window_ms <= 0 {
        FALLBACK_WINDOW_MS
    } else {
        window_ms
    };
    capacity as f64 / (window_ms as f64 / 1000.0)
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}
