//! Persistent job queue
//!
//! Durable QueueJob rows with priority ordering, scheduled execution and
//! retry accounting. At most one job per file entry is active (QUEUED or
//! RUNNING) at any moment; claiming is a compare-and-set so concurrent
//! workers never run the same job.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use super::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "high" => JobPriority::High,
            "normal" => JobPriority::Normal,
            "low" => JobPriority::Low,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// One scheduled execution attempt for a file entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueJob {
    pub id: i64,
    pub file_entry_id: i64,
    pub batch_id: Option<i64>,
    pub priority: String,
    pub state: String,
    pub attempt: i64,
    pub max_attempts: i64,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueJob {
    pub fn job_priority(&self) -> JobPriority {
        JobPriority::parse(&self.priority).unwrap_or_default()
    }
}

/// Outcome of a requeue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueResult {
    /// Scheduled for another attempt
    Requeued { attempt: i64, at: DateTime<Utc> },
    /// Attempts exhausted; the job was failed instead
    Exhausted,
}

/// Aggregate queue counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatistics {
    pub total: i64,
    pub queued: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub success_rate: f64,
}

pub struct QueueRepository {
    pool: DbPool,
}

impl QueueRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Enqueue a job for a file entry. Idempotent: if an active job for
    /// the entry already exists, its id is returned unchanged.
    pub async fn enqueue(
        &self,
        file_entry_id: i64,
        priority: JobPriority,
        scheduled_at: Option<DateTime<Utc>>,
        max_attempts: u32,
        batch_id: Option<i64>,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM queue_jobs
            WHERE file_entry_id = $1 AND state IN ('queued', 'running')
            "#,
        )
        .bind(file_entry_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((id,)) = existing {
            tx.commit().await?;
            return Ok(id);
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO queue_jobs
                (file_entry_id, batch_id, priority, state, attempt, max_attempts,
                 scheduled_at, created_at, updated_at)
            VALUES ($1, $2, $3, 'queued', 0, $4, $5, $6, $6)
            "#,
        )
        .bind(file_entry_id)
        .bind(batch_id)
        .bind(priority.as_str())
        .bind(max_attempts as i64)
        .bind(scheduled_at.unwrap_or(now))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        let id = result.last_insert_rowid();
        info!(
            job_id = id,
            file_entry_id = file_entry_id,
            priority = priority.as_str(),
            "Job enqueued"
        );
        Ok(id)
    }

    /// Claim the next dispatchable job for a worker.
    ///
    /// Dispatch order is strict priority, then scheduled_at, then id.
    /// Jobs belonging to a batch are held back while the batch already
    /// has `concurrency_limit` jobs running. The state flip is a
    /// compare-and-set, so a lost race returns None rather than a
    /// double claim.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<QueueJob>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query_as::<_, QueueJob>(
            r#"
            SELECT * FROM queue_jobs
            WHERE state = 'queued'
              AND scheduled_at <= $1
              AND (
                batch_id IS NULL
                OR (SELECT COUNT(*) FROM queue_jobs r
                    WHERE r.batch_id = queue_jobs.batch_id AND r.state = 'running')
                   < (SELECT concurrency_limit FROM batch_jobs b
                      WHERE b.id = queue_jobs.batch_id)
              )
            ORDER BY
                CASE priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END,
                scheduled_at ASC,
                id ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let updated = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'running', started_at = $2, claimed_by = $3, updated_at = $2
            WHERE id = $1 AND state = 'queued'
            "#,
        )
        .bind(job.id)
        .bind(now)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if updated.rows_affected() == 0 {
            // Another worker took it between select and update
            return Ok(None);
        }

        self.get(job.id).await
    }

    pub async fn get(&self, job_id: i64) -> Result<Option<QueueJob>> {
        let job = sqlx::query_as::<_, QueueJob>("SELECT * FROM queue_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn active_for_entry(&self, file_entry_id: i64) -> Result<Option<QueueJob>> {
        let job = sqlx::query_as::<_, QueueJob>(
            "SELECT * FROM queue_jobs WHERE file_entry_id = $1 AND state IN ('queued', 'running')",
        )
        .bind(file_entry_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn complete(&self, job_id: i64) -> Result<()> {
        self.finish(job_id, JobState::Done, None).await
    }

    pub async fn fail(&self, job_id: i64, error: &str) -> Result<()> {
        self.finish(job_id, JobState::Failed, Some(error)).await
    }

    pub async fn cancel(&self, job_id: i64) -> Result<()> {
        self.finish(job_id, JobState::Cancelled, None).await
    }

    async fn finish(&self, job_id: i64, state: JobState, error: Option<&str>) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = $2, finished_at = $3, updated_at = $3,
                last_error = COALESCE($4, last_error)
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(state.as_str())
        .bind(now)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Schedule another attempt after `delay`. When attempts are
    /// exhausted the job is failed instead.
    pub async fn requeue(&self, job_id: i64, delay: Duration, error: &str) -> Result<RequeueResult> {
        let job = self
            .get(job_id)
            .await?
            .with_context(|| format!("queue job {job_id} not found"))?;

        let next_attempt = job.attempt + 1;
        if next_attempt >= job.max_attempts {
            warn!(
                job_id = job_id,
                attempts = next_attempt,
                "Attempts exhausted, failing job"
            );
            self.fail(job_id, error).await?;
            return Ok(RequeueResult::Exhausted);
        }

        let now = Utc::now();
        let at = now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'queued', attempt = $2, scheduled_at = $3,
                last_error = $4, claimed_by = NULL, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(next_attempt)
        .bind(at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(
            job_id = job_id,
            attempt = next_attempt,
            delay_secs = delay.as_secs(),
            "Job requeued with backoff"
        );
        Ok(RequeueResult::Requeued {
            attempt: next_attempt,
            at,
        })
    }

    /// Startup recovery: RUNNING jobs whose claim is older than the grace
    /// period belonged to a crashed process and go back to QUEUED.
    pub async fn reset_stale_running(&self, grace: Duration) -> Result<u64> {
        let cutoff =
            Utc::now() - ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::zero());
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'queued', claimed_by = NULL, updated_at = $2
            WHERE state = 'running' AND started_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            warn!(count = count, "Reset stale running jobs after restart");
        }
        Ok(count)
    }

    pub async fn statistics(&self) -> Result<QueueStatistics> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM queue_jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let counts: HashMap<String, i64> = rows.into_iter().collect();
        let get = |k: &str| counts.get(k).copied().unwrap_or(0);
        let done = get("done");
        let failed = get("failed");
        let finished = done + failed;

        Ok(QueueStatistics {
            total: counts.values().sum(),
            queued: get("queued"),
            running: get("running"),
            done,
            failed,
            cancelled: get("cancelled"),
            success_rate: if finished > 0 {
                done as f64 / finished as f64 * 100.0
            } else {
                0.0
            },
        })
    }

    /// Remove finished jobs older than the given age. Returns the number
    /// of rows deleted.
    pub async fn clear_completed(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(older_than).unwrap_or_else(|_| ChronoDuration::zero());
        let result = sqlx::query(
            "DELETE FROM queue_jobs WHERE state = 'done' AND finished_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Cancel every queued job owned by a batch. Running jobs are left to
    /// their workers, which observe the batch cancellation separately.
    pub async fn cancel_queued_for_batch(&self, batch_id: i64) -> Result<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'cancelled', finished_at = $2, updated_at = $2
            WHERE batch_id = $1 AND state = 'queued'
            "#,
        )
        .bind(batch_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
