//! Queue worker
//!
//! Drives the persistent queue into the pipeline: claim a job, resume
//! the entry from its checkpoints, run stages until done or failure,
//! then complete, requeue with backoff, or fail. Concurrency applies to
//! distinct files; per-file execution is strictly serial because the
//! queue admits one active job per entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::batches::BatchOutcome;
use crate::db::{BatchRepository, QueueJob, QueueRepository, RequeueResult, Stage};
use crate::error::PipelineError;
use crate::events::{EventSink, PipelineEvent};
use crate::pipeline::{Pipeline, PipelineRun};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Distinct entries processed concurrently
    pub concurrency: usize,
    /// Queue poll interval when idle
    pub poll_interval: Duration,
    /// RUNNING jobs older than this are reset at startup
    pub stale_running_grace: Duration,
    /// Cap on the requeue backoff delay
    pub retry_delay_cap: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(5),
            stale_running_grace: Duration::from_secs(300),
            retry_delay_cap: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub running: bool,
    pub active_jobs: usize,
    pub concurrency: usize,
}

pub struct QueueWorker {
    id: String,
    queue: QueueRepository,
    batches: BatchRepository,
    pipeline: Arc<Pipeline>,
    events: EventSink,
    config: WorkerConfig,
    active: Mutex<HashMap<i64, CancellationToken>>,
    shutdown: CancellationToken,
}

impl QueueWorker {
    pub fn new(
        queue: QueueRepository,
        batches: BatchRepository,
        pipeline: Arc<Pipeline>,
        events: EventSink,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            queue,
            batches,
            pipeline,
            events,
            config,
            active: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request a graceful stop; in-flight jobs observe it at the next
    /// stage boundary.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn status(&self) -> WorkerStatus {
        WorkerStatus {
            worker_id: self.id.clone(),
            running: !self.shutdown.is_cancelled(),
            active_jobs: self.active.lock().await.len(),
            concurrency: self.config.concurrency,
        }
    }

    /// Cancel one job cooperatively. A running job stops at its next
    /// boundary; a queued job is cancelled in place.
    pub async fn cancel_job(&self, job_id: i64) -> anyhow::Result<()> {
        if let Some(token) = self.active.lock().await.get(&job_id) {
            token.cancel();
            return Ok(());
        }
        self.queue.cancel(job_id).await?;
        if let Some(job) = self.queue.get(job_id).await? {
            self.finalize_cancelled_entry(&job).await?;
        }
        Ok(())
    }

    /// Main loop. Resets crashed RUNNING jobs once, then claims and
    /// processes until shutdown.
    pub async fn run(self: Arc<Self>) {
        info!(worker = %self.id, concurrency = self.config.concurrency, "Queue worker starting");

        if let Err(e) = self
            .queue
            .reset_stale_running(self.config.stale_running_grace)
            .await
        {
            error!(error = %e, "Failed to reset stale running jobs");
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let claimed = match self.queue.claim(&self.id).await {
                Ok(job) => job,
                Err(e) => {
                    error!(error = %e, "Queue claim failed");
                    None
                }
            };

            match claimed {
                Some(job) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.process_job(job).await;
                        drop(permit);
                    });
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        info!(worker = %self.id, "Queue worker stopped");
    }

    async fn process_job(&self, job: QueueJob) {
        let cancel = self.shutdown.child_token();
        self.active.lock().await.insert(job.id, cancel.clone());

        debug!(
            job_id = job.id,
            entry_id = job.file_entry_id,
            attempt = job.attempt,
            "Processing job"
        );

        let result = self.pipeline.process_entry(job.file_entry_id, &cancel).await;
        self.active.lock().await.remove(&job.id);

        match result {
            Ok(PipelineRun::Finished) => {
                if let Err(e) = self.queue.complete(job.id).await {
                    error!(job_id = job.id, error = %e, "Failed to complete job");
                }
                let release_name = self
                    .pipeline
                    .services()
                    .entries
                    .get_by_id(job.file_entry_id)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|e| e.release_name);
                self.events.emit(PipelineEvent::FileEntryCompleted {
                    entry_id: job.file_entry_id,
                    release_name,
                });
                self.record_batch_outcome(&job, BatchOutcome::Completed).await;
                info!(job_id = job.id, entry_id = job.file_entry_id, "Job completed");
            }
            Ok(PipelineRun::AwaitingApproval) => {
                // The job's work is done; a fresh job is enqueued when
                // the entry is approved
                if let Err(e) = self.queue.complete(job.id).await {
                    error!(job_id = job.id, error = %e, "Failed to complete job");
                }
                self.record_batch_outcome(&job, BatchOutcome::Completed).await;
            }
            Err(PipelineError::Cancelled) => {
                if let Err(e) = self.queue.cancel(job.id).await {
                    error!(job_id = job.id, error = %e, "Failed to cancel job");
                }
                if let Err(e) = self.finalize_cancelled_entry(&job).await {
                    error!(job_id = job.id, error = %e, "Failed to finalize cancelled entry");
                }
                self.record_batch_outcome(&job, BatchOutcome::Cancelled).await;
                info!(job_id = job.id, "Job cancelled");
            }
            Err(e) if e.is_retryable() => {
                let delay = retry_delay(job.attempt as u32, self.config.retry_delay_cap);
                warn!(
                    job_id = job.id,
                    entry_id = job.file_entry_id,
                    error = %e,
                    delay_secs = delay.as_secs(),
                    "Retryable failure, requeueing"
                );
                match self.queue.requeue(job.id, delay, &e.to_string()).await {
                    Ok(RequeueResult::Requeued { .. }) => {}
                    Ok(RequeueResult::Exhausted) => {
                        self.fail_entry(&job, &e).await;
                    }
                    Err(db_err) => {
                        error!(job_id = job.id, error = %db_err, "Requeue failed");
                    }
                }
            }
            Err(e) => {
                warn!(
                    job_id = job.id,
                    entry_id = job.file_entry_id,
                    error = %e,
                    "Terminal failure"
                );
                if let Err(db_err) = self.queue.fail(job.id, &e.to_string()).await {
                    error!(job_id = job.id, error = %db_err, "Failed to fail job");
                }
                self.fail_entry(&job, &e).await;
            }
        }
    }

    async fn fail_entry(&self, job: &QueueJob, error: &PipelineError) {
        let entries = &self.pipeline.services().entries;
        if let Err(e) = entries
            .mark_failed(job.file_entry_id, error.kind(), &error.to_string())
            .await
        {
            error!(entry_id = job.file_entry_id, error = %e, "Failed to mark entry failed");
        }
        self.events.emit(PipelineEvent::FileEntryFailed {
            entry_id: job.file_entry_id,
            kind: error.kind(),
            message: error.to_string(),
        });
        self.record_batch_outcome(job, BatchOutcome::Failed).await;
    }

    /// An entry is only marked CANCELLED when nothing is salvageable;
    /// with any checkpoint set, a later re-enqueue resumes from it.
    async fn finalize_cancelled_entry(&self, job: &QueueJob) -> anyhow::Result<()> {
        let entries = &self.pipeline.services().entries;
        if let Some(entry) = entries.get_by_id(job.file_entry_id).await? {
            let nothing_done = entry.next_stage() == Some(Stage::Scan);
            if nothing_done {
                entries.mark_cancelled(entry.id).await?;
            }
        }
        Ok(())
    }

    async fn record_batch_outcome(&self, job: &QueueJob, outcome: BatchOutcome) {
        let Some(batch_id) = job.batch_id else { return };
        match self.batches.record_outcome(batch_id, outcome).await {
            Ok(batch) => {
                self.events.emit(PipelineEvent::BatchProgressed {
                    batch_id,
                    completed: batch.completed,
                    failed: batch.failed,
                    cancelled: batch.cancelled,
                    total: batch.total,
                });
            }
            Err(e) => error!(batch_id = batch_id, error = %e, "Failed to record batch outcome"),
        }
    }
}

/// Doubling backoff from the job's attempt counter, capped.
fn retry_delay(attempt: u32, cap: Duration) -> Duration {
    let secs = 2u64.saturating_pow(attempt.min(16));
    Duration::from_secs(secs).min(cap)
}
