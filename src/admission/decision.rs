//! Admission decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::Job;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Accepted,
    Rejected,
}

/// Why a job was accepted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Admitted,
    InvalidConfig,
    PriorityTooLow,
    DuplicateRequest,
    RateLimitExceeded,
    BatchQuotaExceeded,
    StoreError,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Admitted => "admitted",
            Reason::InvalidConfig => "invalid_config",
            Reason::PriorityTooLow => "priority_too_low",
            Reason::DuplicateRequest => "duplicate_request",
            Reason::RateLimitExceeded => "rate_limit_exceeded",
            Reason::BatchQuotaExceeded => "batch_quota_exceeded",
            Reason::StoreError => "store_error",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The terminal result of admitting one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub job_id: String,
    pub batch_id: Option<String>,
    pub batch_name: Option<String>,
    pub status: DecisionStatus,
    pub reason: Reason,
    pub timestamp: DateTime<Utc>,
    /// The job this decision was rendered for
    pub job: Job,
    /// The policy document the check ran under
    pub config: Option<Value>,
}

impl Decision {
    pub fn accepted(job: Job, config: Option<Value>) -> Self {
        Self::new(job, DecisionStatus::Accepted, Reason::Admitted, config)
    }

    pub fn rejected(job: Job, reason: Reason, config: Option<Value>) -> Self {
        Self::new(job, DecisionStatus::Rejected, reason, config)
    }

    fn new(job: Job, status: DecisionStatus, reason: Reason, config: Option<Value>) -> Self {
        Self {
            job_id: job.job_id.clone(),
            batch_id: job.meta.batch_id.clone(),
            batch_name: job.meta.batch_name.clone(),
            status,
            reason,
            timestamp: Utc::now(),
            job,
            config,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == DecisionStatus::Accepted
    }
}
