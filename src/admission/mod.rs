//! Admission control: jobs in, accept/reject decisions out.
//!
//! The controller runs a job through its gates in a fixed order: resolve the
//! effective policy, check priority, claim the job id for idempotency, then
//! charge every quota bucket the job touches in one atomic store call.

mod controller;
mod decision;
mod job;
mod requests;
mod stats;

pub use controller::{AdmissionController, DEFAULT_STORE_TIMEOUT};
pub use decision::{Decision, DecisionStatus, Reason};
pub use job::{Job, JobSource, SubmissionMeta};
pub use requests::{build_requests, dependency_key, tenant_key, GLOBAL_KEY};
pub use stats::{AdmissionStats, DecisionSummary, StatsSnapshot, RECENT_DECISIONS};
