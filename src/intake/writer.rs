//! Decision writer workers and the job-queue drain.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::admission::{Decision, Job};
use crate::error::Result;

/// Destination for rendered decisions.
#[async_trait]
pub trait DecisionSink: Send + Sync + 'static {
    async fn write(&self, decision: &Decision) -> Result<()>;
}

/// Records every decision through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl DecisionSink for LogSink {
    async fn write(&self, decision: &Decision) -> Result<()> {
        info!(
            job_id = %decision.job_id,
            status = ?decision.status,
            reason = %decision.reason,
            batch_id = decision.batch_id.as_deref().unwrap_or_default(),
            batch_name = decision.batch_name.as_deref().unwrap_or_default(),
            tenant_id = %decision.job.tenant_id,
            priority = decision.job.priority,
            timestamp = %decision.timestamp,
            "Decision recorded"
        );
        Ok(())
    }
}

/// A pool of workers draining the decision queue into a sink.
///
/// Workers exit once every producer of the queue has been dropped and the
/// queue is empty.
pub struct DecisionWriter {
    workers: Vec<JoinHandle<()>>,
}

impl DecisionWriter {
    /// Start `workers` tasks reading from `rx`.
    pub fn spawn(
        workers: usize,
        rx: mpsc::Receiver<Decision>,
        sink: Arc<dyn DecisionSink>,
    ) -> Self {
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..workers.max(1))
            .map(|id| {
                let rx = Arc::clone(&rx);
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    debug!(worker = id, "Decision writer started");
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(decision) = next else { break };
                        if let Err(e) = sink.write(&decision).await {
                            error!(worker = id, job_id = %decision.job_id, error = %e, "Failed to write decision");
                        }
                    }
                    debug!(worker = id, "Decision writer stopped");
                })
            })
            .collect();
        Self { workers }
    }

    /// Wait for every worker to finish.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Decision writer task failed");
            }
        }
    }
}

/// Drain admitted jobs until the queue closes, returning how many were seen.
///
/// Execution is outside this crate; each job is handed off with a log record.
pub async fn drain_jobs(mut rx: mpsc::Receiver<Job>) -> u64 {
    let mut released = 0;
    while let Some(job) = rx.recv().await {
        released += 1;
        info!(
            job_id = %job.job_id,
            tenant_id = %job.tenant_id,
            batch_id = job.meta.batch_id.as_deref().unwrap_or_default(),
            "Job released for execution"
        );
    }
    released
}
