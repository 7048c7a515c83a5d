//! Policy parsing and validation.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use super::model::{Policy, SUPPORTED_POLICY_VERSION};
use crate::admission::Job;

/// Errors raised while parsing or validating a policy.
///
/// On the admission path these become `invalid_config` rejections.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("empty config")]
    Empty,

    #[error("invalid config JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported policy version: {0}")]
    UnsupportedVersion(u32),

    #[error("dependency '{0}' must define rate_limit or concurrent")]
    MissingDependencyLimit(String),

    #[error("{0} cannot be negative")]
    Negative(String),

    #[error("{0} must be > 0")]
    NotPositive(String),
}

type Result<T> = std::result::Result<T, PolicyError>;

/// Parse and validate a policy document.
pub fn parse_policy(raw: &str) -> Result<Policy> {
    if raw.trim().is_empty() {
        return Err(PolicyError::Empty);
    }
    let policy: Policy = serde_json::from_str(raw)?;
    policy.validate()?;
    Ok(policy)
}

/// Read, parse and validate a policy file.
pub fn load_policy<P: AsRef<Path>>(path: P) -> Result<Policy> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    let policy = parse_policy(&contents)?;
    info!(
        path = %path.display(),
        version = policy.version,
        dependencies = policy.dependencies.len(),
        "Loaded admission policy"
    );
    Ok(policy)
}

/// Parse the policy override embedded in a job submission.
///
/// Besides the regular validation, an embedded override must declare a
/// positive global cap, window and idempotency window.
pub fn parse_embedded(raw: &Value) -> Result<Policy> {
    if raw.is_null() || raw.as_object().is_some_and(|o| o.is_empty()) {
        return Err(PolicyError::Empty);
    }
    let policy = Policy::deserialize(raw)?;

    if policy.global_execution_limit.max_jobs <= 0 {
        return Err(PolicyError::NotPositive("max_jobs".into()));
    }
    if policy.global_execution_limit.window_ms <= 0 {
        return Err(PolicyError::NotPositive("window_ms".into()));
    }
    if policy.default_job_policy.idempotency_window_ms <= 0 {
        return Err(PolicyError::NotPositive("idempotency_window_ms".into()));
    }

    policy.validate()?;
    Ok(policy)
}

/// Pick the policy a check runs under: the job's embedded override when
/// present, the controller's policy otherwise.
pub fn resolve_effective_policy(job: &Job, default: &Arc<Policy>) -> Result<Arc<Policy>> {
    match job.meta.config.as_ref() {
        Some(raw) => parse_embedded(raw).map(Arc::new),
        None => Ok(Arc::clone(default)),
    }
}

impl Policy {
    /// Check the structural invariants of a policy.
    pub fn validate(&self) -> Result<()> {
        if self.version != SUPPORTED_POLICY_VERSION {
            return Err(PolicyError::UnsupportedVersion(self.version));
        }

        for (name, dep) in &self.dependencies {
            if dep.rate_limit.is_none() && dep.concurrency.is_none() {
                return Err(PolicyError::MissingDependencyLimit(name.clone()));
            }
            non_negative(&format!("dependency '{name}' min_interval_ms"), dep.min_interval_ms)?;
            non_negative(&format!("dependency '{name}' warmup_ms"), dep.warmup_ms)?;
            if let Some(limit) = dep.rate_limit {
                non_negative(&format!("dependency '{name}' max_requests"), limit.max_requests)?;
                non_negative(&format!("dependency '{name}' window_ms"), limit.window_ms)?;
            }
            if let Some(concurrency) = dep.concurrency {
                non_negative(&format!("dependency '{name}' max_inflight"), concurrency.max_inflight)?;
            }
        }

        let global = &self.global_execution_limit;
        non_negative("global_execution_limit max_jobs", global.max_jobs)?;
        non_negative("global_execution_limit window_ms", global.window_ms)?;
        non_negative(
            "global_execution_limit max_concurrent_per_tenant",
            global.max_concurrent_per_tenant,
        )?;
        non_negative("global_execution_limit min_interval_ms", global.min_interval_ms)?;

        let job = &self.default_job_policy;
        non_negative("default_job_policy idempotency_window_ms", job.idempotency_window_ms)?;
        for (name, cost) in &job.dependencies {
            non_negative(&format!("default_job_policy dependency '{name}' cost"), *cost)?;
        }

        if let Some(q) = &job.quarantine {
            positive("default_job_policy quarantine failure_threshold", q.failure_threshold)?;
            positive(
                "default_job_policy quarantine quarantine_duration_ms",
                q.quarantine_duration_ms,
            )?;
            positive(
                "default_job_policy quarantine monitoring_window_ms",
                q.monitoring_window_ms,
            )?;
        }

        Ok(())
    }
}

fn non_negative(field: &str, value: i64) -> Result<()> {
    if value < 0 {
        return Err(PolicyError::Negative(field.to_string()));
    }
    Ok(())
}

fn positive(field: &str, value: i64) -> Result<()> {
    if value <= 0 {
        return Err(PolicyError::NotPositive(field.to_string()));
    }
    Ok(())
}
