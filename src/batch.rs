//! Batch controller
//!
//! Bundles many file entries into one tracked unit: a shared concurrency
//! cap (enforced by the queue's claim query), a priority applied to
//! every job, and rolled-up progress counters. Cancelling a batch
//! cascades to its queued jobs; running jobs stop at their next
//! boundary via the worker.

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::db::{BatchRepository, FileEntryRepository, JobPriority, QueueRepository};

/// Per-id breakdown of a batch submission.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSubmission {
    pub batch_id: i64,
    pub added: Vec<i64>,
    pub already_queued: Vec<i64>,
    pub not_found: Vec<i64>,
}

pub struct BatchController {
    queue: QueueRepository,
    batches: BatchRepository,
    entries: FileEntryRepository,
    max_attempts: u32,
}

impl BatchController {
    pub fn new(
        queue: QueueRepository,
        batches: BatchRepository,
        entries: FileEntryRepository,
        max_attempts: u32,
    ) -> Self {
        Self {
            queue,
            batches,
            entries,
            max_attempts,
        }
    }

    /// Enqueue a set of entries under one batch.
    ///
    /// Entries that already have an active job are reported rather than
    /// double-queued; unknown ids are reported rather than failing the
    /// whole submission.
    pub async fn submit(
        &self,
        file_entry_ids: Vec<i64>,
        priority: JobPriority,
        concurrency_limit: i64,
    ) -> Result<BatchSubmission> {
        let batch_id = self
            .batches
            .create(file_entry_ids.len() as i64, priority, concurrency_limit)
            .await?;

        let mut submission = BatchSubmission {
            batch_id,
            added: Vec::new(),
            already_queued: Vec::new(),
            not_found: Vec::new(),
        };

        for entry_id in file_entry_ids {
            if self.entries.get_by_id(entry_id).await?.is_none() {
                submission.not_found.push(entry_id);
                continue;
            }

            if self.queue.active_for_entry(entry_id).await?.is_some() {
                submission.already_queued.push(entry_id);
                continue;
            }

            self.queue
                .enqueue(entry_id, priority, None, self.max_attempts, Some(batch_id))
                .await?;
            submission.added.push(entry_id);
        }

        info!(
            batch_id = batch_id,
            added = submission.added.len(),
            already_queued = submission.already_queued.len(),
            not_found = submission.not_found.len(),
            "Batch submitted"
        );
        Ok(submission)
    }

    /// Cancel the batch and its still-queued jobs.
    pub async fn cancel(&self, batch_id: i64) -> Result<u64> {
        let cancelled = self.queue.cancel_queued_for_batch(batch_id).await?;
        self.batches.mark_cancelled(batch_id).await?;
        info!(batch_id = batch_id, cancelled_jobs = cancelled, "Batch cancelled");
        Ok(cancelled)
    }

    pub async fn get(&self, batch_id: i64) -> Result<Option<crate::db::BatchJob>> {
        self.batches.get(batch_id).await
    }
}
