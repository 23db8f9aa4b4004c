//! Batch execution: a fixed pool of workers drains a job's rows in input
//! order, the suspension barrier decides the job's terminal status, and
//! external resolutions run the post-ambiguity tail.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::RowError;
use crate::jobs::ResolveGuard;
use crate::models::{InputRow, JobMode, JobStatus, RowStatus};
use crate::pipeline::row::{finish_resolved_row, process_row, PipelineContext};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("row {0} not found in this job")]
    RowNotFound(i64),
    #[error("row {row_id} is not awaiting resolution (status: {status})")]
    NotAmbiguous { row_id: i64, status: String },
    #[error("uuid {0} is not among the saved candidates")]
    UnknownCandidate(String),
    #[error(transparent)]
    Row(#[from] RowError),
}

pub struct BatchScheduler {
    ctx: Arc<PipelineContext>,
    workers: usize,
    cancel_tokens: parking_lot::Mutex<HashMap<String, CancellationToken>>,
}

impl BatchScheduler {
    pub fn new(ctx: Arc<PipelineContext>, workers: usize) -> Self {
        Self {
            ctx,
            workers: workers.max(1),
            cancel_tokens: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Process every pending row of the job and return its terminal
    /// status: `completed`, or `awaiting_resolution` when review mode
    /// left ambiguities behind, or `error` after cancellation.
    pub async fn run_job(&self, job_id: &str) -> anyhow::Result<JobStatus> {
        let job = self
            .ctx
            .jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {job_id} not found"))?;

        let cancel = CancellationToken::new();
        self.cancel_tokens
            .lock()
            .insert(job_id.to_string(), cancel.clone());

        self.ctx
            .jobs
            .update_job_status(job_id, JobStatus::Running, None)
            .await?;

        let rows = self.ctx.jobs.load_rows(job_id).await?;
        let pending: VecDeque<InputRow> = rows
            .into_iter()
            .filter(|r| r.status == RowStatus::Pending)
            .collect();
        let total_pending = pending.len();
        let queue = Arc::new(parking_lot::Mutex::new(pending));

        tracing::info!(
            job_id,
            rows = total_pending,
            workers = self.workers,
            mode = job.mode.as_str(),
            "Job started"
        );

        let worker_count = self.workers.min(total_pending.max(1));
        let mut handles = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let queue = Arc::clone(&queue);
            let ctx = Arc::clone(&self.ctx);
            let cancel = cancel.clone();
            let mode = job.mode;

            handles.push(tokio::spawn(async move {
                loop {
                    let row = queue.lock().pop_front();
                    let Some(row) = row else { break };

                    if cancel.is_cancelled() {
                        // Rows that never started are rolled straight to
                        // error; nothing partial exists to persist.
                        let _ = ctx
                            .jobs
                            .update_row_status(row.id, RowStatus::Error, Some("cancelled"))
                            .await;
                        continue;
                    }

                    tracing::debug!(worker, row_id = row.id, "Worker picked row");
                    process_row(&ctx, &row, mode, &cancel).await;
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        self.cancel_tokens.lock().remove(job_id);

        // Suspension barrier: all workers have drained.
        let counters = self.ctx.jobs.counters(job_id).await?;
        let done = counters.calculated + counters.ambiguous + counters.errors;

        let status = if cancel.is_cancelled() {
            JobStatus::Error
        } else if job.mode == JobMode::Review && counters.ambiguous > 0 {
            JobStatus::AwaitingResolution
        } else {
            JobStatus::Completed
        };

        self.ctx
            .jobs
            .update_job_status(job_id, status, Some(done))
            .await?;

        tracing::info!(
            job_id,
            status = status.as_str(),
            calculated = counters.calculated,
            ambiguous = counters.ambiguous,
            errors = counters.errors,
            "Job drained"
        );
        Ok(status)
    }

    /// Signal cancellation. In-flight rows finish their current LLM call
    /// and then abort; queued rows are rolled to error immediately.
    pub fn cancel_job(&self, job_id: &str) {
        if let Some(token) = self.cancel_tokens.lock().get(job_id) {
            tracing::info!(job_id, "Job cancellation requested");
            token.cancel();
        }
    }

    /// Resolve one suspended row by picking a uuid from its saved
    /// candidate set. Idempotent once the row is calculated; rejected in
    /// every other non-ambiguous state.
    pub async fn resolve(
        &self,
        job_id: &str,
        row_id: i64,
        selected_uuid: &str,
    ) -> Result<(), ResolveError> {
        self.ctx
            .jobs
            .get_job(job_id)
            .await
            .map_err(RowError::from)?
            .ok_or_else(|| ResolveError::JobNotFound(job_id.to_string()))?;

        let row = match self
            .ctx
            .jobs
            .resolve_row(job_id, row_id, selected_uuid)
            .await
            .map_err(RowError::from)?
        {
            ResolveGuard::Ready(row) => row,
            ResolveGuard::AlreadyResolved => return Ok(()),
            ResolveGuard::NotFound => return Err(ResolveError::RowNotFound(row_id)),
            ResolveGuard::NotAmbiguous(status) => {
                return Err(ResolveError::NotAmbiguous {
                    row_id,
                    status: status.as_str().to_string(),
                })
            }
            ResolveGuard::UnknownCandidate => {
                return Err(ResolveError::UnknownCandidate(selected_uuid.to_string()))
            }
        };

        // The row stays ambiguous if the tail fails (e.g. the unit
        // conversion), so the user can pick another candidate.
        finish_resolved_row(&self.ctx, &row, selected_uuid).await?;

        // Completion check: the job flips to completed once the last
        // ambiguity is resolved.
        let counters = self
            .ctx
            .jobs
            .counters(job_id)
            .await
            .map_err(RowError::from)?;
        if counters.ambiguous == 0 && counters.pending == 0 && counters.processing == 0 {
            self.ctx
                .jobs
                .update_job_status(
                    job_id,
                    JobStatus::Completed,
                    Some(counters.calculated + counters.errors),
                )
                .await
                .map_err(RowError::from)?;
        }

        Ok(())
    }

    /// Resolve several rows; each outcome is reported independently.
    pub async fn resolve_batch(
        &self,
        job_id: &str,
        resolutions: &[(i64, String)],
    ) -> Vec<(i64, Result<(), ResolveError>)> {
        let mut results = Vec::with_capacity(resolutions.len());
        for (row_id, uuid) in resolutions {
            let outcome = self.resolve(job_id, *row_id, uuid).await;
            results.push((*row_id, outcome));
        }
        results
    }
}
