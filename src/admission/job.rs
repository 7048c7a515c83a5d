//! Job submissions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Where a submission entered the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Dashboard,
    System,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Dashboard => "dashboard",
            JobSource::System => "system",
        }
    }
}

impl std::fmt::Display for JobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single execution request awaiting admission.
///
/// Carries identity, priority, declared dependency costs and an opaque
/// payload. It says nothing about how or when the job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Empty when omitted; such a job is not well formed
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub priority: i64,
    /// Dependency name -> cost charged against that dependency's bucket
    #[serde(default)]
    pub dependencies: HashMap<String, u64>,
    #[serde(default)]
    pub payload: Value,
    /// Metadata stamped by the intake layer
    #[serde(flatten)]
    pub meta: SubmissionMeta,
}

/// Metadata the intake layer attaches to a submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<JobSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Embedded per-submission policy override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_id: Option<String>,
}

impl Job {
    /// Create a job with no dependencies and an empty payload.
    pub fn new(job_id: impl Into<String>, tenant_id: impl Into<String>, priority: i64) -> Self {
        Self {
            job_id: job_id.into(),
            tenant_id: tenant_id.into(),
            priority,
            dependencies: HashMap::new(),
            payload: Value::Null,
            meta: SubmissionMeta::default(),
        }
    }

    pub fn with_dependency(mut self, name: impl Into<String>, cost: u64) -> Self {
        self.dependencies.insert(name.into(), cost);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Attach an embedded policy override and its identifier.
    pub fn with_config(mut self, config: Value, config_id: impl Into<String>) -> Self {
        self.meta.config = Some(config);
        self.meta.config_id = Some(config_id.into());
        self
    }

    /// A job needs both an id and a tenant to be considered at all.
    pub fn is_well_formed(&self) -> bool {
        !self.job_id.is_empty() && !self.tenant_id.is_empty()
    }
}
