//! Running admission statistics.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::decision::{Decision, Reason};

/// How many recent decisions are retained.
pub const RECENT_DECISIONS: usize = 50;

/// Counters and a short log of recent decisions.
#[derive(Debug, Default)]
pub struct AdmissionStats {
    inner: Mutex<StatsSnapshot>,
}

/// A point-in-time copy of [`AdmissionStats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub admitted_requests: u64,
    pub rejected_requests: u64,
    pub rejection_reasons: HashMap<Reason, u64>,
    /// Oldest first
    pub recent_decisions: VecDeque<DecisionSummary>,
}

/// The part of a decision kept in the recent log.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionSummary {
    pub job_id: String,
    pub admitted: bool,
    pub reason: Reason,
    pub timestamp: DateTime<Utc>,
}

impl AdmissionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a decision and append it to the recent log.
    pub fn record(&self, decision: &Decision) {
        let mut stats = self.inner.lock();
        stats.total_requests += 1;
        if decision.is_accepted() {
            stats.admitted_requests += 1;
        } else {
            stats.rejected_requests += 1;
            *stats.rejection_reasons.entry(decision.reason).or_insert(0) += 1;
        }

        stats.recent_decisions.push_back(DecisionSummary {
            job_id: decision.job_id.clone(),
            admitted: decision.is_accepted(),
            reason: decision.reason,
            timestamp: decision.timestamp,
        });
        if stats.recent_decisions.len() > RECENT_DECISIONS {
            stats.recent_decisions.pop_front();
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().clone()
    }
}
