//! Batch job store
//!
//! A batch bundles many file entries under a shared concurrency cap and
//! rolls their outcomes up into progress counters. Counters are updated
//! as jobs finish, so progress is eventually consistent with the queue.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::DbPool;
use crate::db::queue::JobPriority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => BatchStatus::Pending,
            "running" => BatchStatus::Running,
            "completed" => BatchStatus::Completed,
            "cancelled" => BatchStatus::Cancelled,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BatchJob {
    pub id: i64,
    pub status: String,
    pub priority: String,
    pub concurrency_limit: i64,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchJob {
    pub fn batch_status(&self) -> BatchStatus {
        BatchStatus::parse(&self.status).unwrap_or(BatchStatus::Pending)
    }

    pub fn is_finished(&self) -> bool {
        self.completed + self.failed + self.cancelled >= self.total
    }
}

/// Outcome of one job within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    Failed,
    Cancelled,
}

pub struct BatchRepository {
    pool: DbPool,
}

impl BatchRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        total: i64,
        priority: JobPriority,
        concurrency_limit: i64,
    ) -> Result<i64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO batch_jobs
                (status, priority, concurrency_limit, total, created_at, updated_at)
            VALUES ('running', $1, $2, $3, $4, $4)
            "#,
        )
        .bind(priority.as_str())
        .bind(concurrency_limit.max(1))
        .bind(total)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<BatchJob>> {
        let batch = sqlx::query_as::<_, BatchJob>("SELECT * FROM batch_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(batch)
    }

    /// Fold one job outcome into the batch counters, finalizing the
    /// batch status once every job is accounted for.
    pub async fn record_outcome(&self, id: i64, outcome: BatchOutcome) -> Result<BatchJob> {
        let column = match outcome {
            BatchOutcome::Completed => "completed",
            BatchOutcome::Failed => "failed",
            BatchOutcome::Cancelled => "cancelled",
        };

        // Counter column is one of a fixed set, never user input
        let sql = format!(
            "UPDATE batch_jobs SET {column} = {column} + 1, updated_at = $2 WHERE id = $1"
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        let batch = self
            .get(id)
            .await?
            .with_context(|| format!("batch {id} not found"))?;

        if batch.is_finished() && batch.batch_status() == BatchStatus::Running {
            sqlx::query("UPDATE batch_jobs SET status = 'completed', updated_at = $2 WHERE id = $1")
                .bind(id)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
        }

        Ok(self.get(id).await?.unwrap_or(batch))
    }

    pub async fn mark_cancelled(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batch_jobs SET status = 'cancelled', updated_at = $2
            WHERE id = $1 AND status NOT IN ('completed', 'cancelled')
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
