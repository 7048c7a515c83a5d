//! Submission intake.
//!
//! Stamps incoming jobs with their source, batch and owner metadata, attaches
//! the owner's active policy, runs them through the admission controller and
//! hands the results to the bounded job and decision queues.

mod cache;
mod queue;
mod writer;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::admission::{AdmissionController, Decision, Job, JobSource};
use crate::store::StateStore;

pub use cache::{CachedConfig, ConfigCache};
pub use queue::{bounded, BoundedQueue, DecisionQueue, JobQueue, QueueError};
pub use writer::{drain_jobs, DecisionSink, DecisionWriter, LogSink};

/// Batch id stamped on single submissions from the system source.
pub const SYSTEM_BATCH_ID: &str = "11111111-1111-1111-1111-111111111111";
/// Batch id stamped on single submissions from the dashboard source.
pub const DASHBOARD_BATCH_ID: &str = "22222222-2222-2222-2222-222222222222";

/// Default bound on the number of jobs in one batch submission.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Submission errors raised before any job reaches the controller.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("job {index} is missing job_id or tenant_id")]
    MalformedJob { index: usize },

    #[error("batch_name required")]
    MissingBatchName,

    #[error("batch contains no jobs")]
    EmptyBatch,

    #[error("batch of {size} jobs exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("no active config for owner '{0}'")]
    NoActiveConfig(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Who a submission came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub source: JobSource,
    /// Owner whose active config governs the submission, if any
    #[serde(default)]
    pub owner_id: Option<String>,
}

impl Origin {
    pub fn new(source: JobSource) -> Self {
        Self {
            source,
            owner_id: None,
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }
}

/// Aggregate outcome of a batch submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Full,
    Partial,
    Rejected,
}

/// Result of a batch submission.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub batch_name: String,
    pub status: BatchStatus,
    pub admitted: usize,
    /// Submitted jobs that were not admitted, including any never checked
    pub rejected: usize,
    pub decisions: Vec<Decision>,
}

impl BatchSummary {
    fn new(
        batch_id: String,
        batch_name: String,
        submitted: usize,
        decisions: Vec<Decision>,
    ) -> Self {
        let admitted = decisions.iter().filter(|d| d.is_accepted()).count();
        let rejected = submitted - admitted;
        let status = if admitted == 0 {
            BatchStatus::Rejected
        } else if rejected > 0 {
            BatchStatus::Partial
        } else {
            BatchStatus::Full
        };
        Self {
            batch_id,
            batch_name,
            status,
            admitted,
            rejected,
            decisions,
        }
    }
}

/// Front door for job submissions.
pub struct Intake<S: StateStore> {
    controller: Arc<AdmissionController<S>>,
    configs: Arc<ConfigCache>,
    jobs: JobQueue,
    decisions: DecisionQueue,
    max_batch_size: usize,
}

impl<S: StateStore> Intake<S> {
    pub fn new(
        controller: Arc<AdmissionController<S>>,
        configs: Arc<ConfigCache>,
        jobs: JobQueue,
        decisions: DecisionQueue,
    ) -> Self {
        Self {
            controller,
            configs,
            jobs,
            decisions,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn controller(&self) -> &Arc<AdmissionController<S>> {
        &self.controller
    }

    /// Submit a single job.
    ///
    /// A job-queue slot is reserved before the check so an admitted job is
    /// never dropped for lack of room.
    #[instrument(skip_all, fields(job_id = %job.job_id, source = %origin.source))]
    pub async fn submit(&self, origin: &Origin, mut job: Job) -> Result<Decision, IntakeError> {
        if !job.is_well_formed() {
            return Err(IntakeError::MalformedJob { index: 0 });
        }
        let (batch_id, batch_name) = match origin.source {
            JobSource::System => (SYSTEM_BATCH_ID, "system_batch"),
            JobSource::Dashboard => (DASHBOARD_BATCH_ID, "dashboard_batch"),
        };
        self.stamp(origin, &mut job, batch_id, batch_name)?;

        let permit = self.jobs.reserve()?;
        let decision = self.controller.check(job).await;
        if decision.is_accepted() {
            permit.send(decision.job.clone());
        }
        self.publish(&decision);
        Ok(decision)
    }

    /// Submit a batch, admitting each job on its own.
    ///
    /// Processing stops at the first malformed job or when the job queue
    /// runs out of room; decisions already rendered stand.
    #[instrument(skip_all, fields(batch_size = jobs.len(), batch_name = %batch_name))]
    pub async fn submit_batch(
        &self,
        origin: &Origin,
        batch_name: &str,
        jobs: Vec<Job>,
    ) -> Result<BatchSummary, IntakeError> {
        let batch_id = self.open_batch(origin, batch_name, jobs.len())?;
        let submitted = jobs.len();
        let mut decisions = Vec::with_capacity(submitted);

        for (index, mut job) in jobs.into_iter().enumerate() {
            if !job.is_well_formed() {
                warn!(index, "Malformed job ends batch processing");
                break;
            }
            self.stamp(origin, &mut job, &batch_id, batch_name)?;

            let permit = match self.jobs.reserve() {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(index, error = %e, "Job queue unavailable, batch processing stopped");
                    break;
                }
            };
            let decision = self.controller.check(job).await;
            if decision.is_accepted() {
                permit.send(decision.job.clone());
            }
            self.publish(&decision);
            decisions.push(decision);
        }

        let summary = BatchSummary::new(batch_id, batch_name.to_string(), submitted, decisions);
        info!(
            batch_id = %summary.batch_id,
            status = ?summary.status,
            admitted = summary.admitted,
            rejected = summary.rejected,
            "Batch processed"
        );
        Ok(summary)
    }

    /// Submit a batch that is admitted all-or-nothing.
    ///
    /// Any malformed job rejects the whole submission before a check runs,
    /// and the job queue must have room for every job up front.
    #[instrument(skip_all, fields(batch_size = jobs.len(), batch_name = %batch_name))]
    pub async fn submit_batch_atomic(
        &self,
        origin: &Origin,
        batch_name: &str,
        mut jobs: Vec<Job>,
    ) -> Result<BatchSummary, IntakeError> {
        let batch_id = self.open_batch(origin, batch_name, jobs.len())?;
        if let Some(index) = jobs.iter().position(|job| !job.is_well_formed()) {
            return Err(IntakeError::MalformedJob { index });
        }
        for job in &mut jobs {
            self.stamp(origin, job, &batch_id, batch_name)?;
        }

        let permits = self.jobs.reserve_many(jobs.len())?;
        let submitted = jobs.len();
        let decisions = self.controller.check_batch_atomic(jobs).await;

        for (permit, decision) in permits.into_iter().zip(&decisions) {
            if decision.is_accepted() {
                permit.send(decision.job.clone());
            }
        }
        for decision in &decisions {
            self.publish(decision);
        }

        let summary = BatchSummary::new(batch_id, batch_name.to_string(), submitted, decisions);
        info!(
            batch_id = %summary.batch_id,
            status = ?summary.status,
            "Atomic batch processed"
        );
        Ok(summary)
    }

    /// Validate a batch envelope and mint its id.
    fn open_batch(
        &self,
        origin: &Origin,
        batch_name: &str,
        size: usize,
    ) -> Result<String, IntakeError> {
        if batch_name.is_empty() {
            return Err(IntakeError::MissingBatchName);
        }
        if size == 0 {
            return Err(IntakeError::EmptyBatch);
        }
        if size > self.max_batch_size {
            return Err(IntakeError::BatchTooLarge {
                size,
                max: self.max_batch_size,
            });
        }
        Ok(format!("{}_batch_{}", origin.source, Uuid::new_v4()))
    }

    /// Attach source, batch and owner metadata plus the owner's active config.
    fn stamp(
        &self,
        origin: &Origin,
        job: &mut Job,
        batch_id: &str,
        batch_name: &str,
    ) -> Result<(), IntakeError> {
        job.meta.source = Some(origin.source);
        job.meta.batch_id = Some(batch_id.to_string());
        job.meta.batch_name = Some(batch_name.to_string());

        if let Some(owner) = &origin.owner_id {
            let cached = self
                .configs
                .get(owner)
                .ok_or_else(|| IntakeError::NoActiveConfig(owner.clone()))?;
            job.meta.owner_id = Some(owner.clone());
            job.meta.config = Some(cached.config);
            job.meta.config_id = Some(cached.config_id);
        }
        Ok(())
    }

    fn publish(&self, decision: &Decision) {
        if let Err(e) = self.decisions.offer(decision.clone()) {
            warn!(job_id = %decision.job_id, error = %e, "Decision queue unavailable, record dropped");
        }
    }
}
