//! File entry store
//!
//! One row per source media file. Checkpoint timestamps drive idempotent
//! resumption: a stage whose timestamp is set is never re-run, and a
//! checkpoint is written exactly once, atomically with the status change
//! and the stage's artifacts.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DbPool;
use crate::error::ErrorKind;

/// Processing status of a file entry.
///
/// Transitions form a monotone chain; the only departures from the chain
/// are FAILED and CANCELLED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Scanned,
    Analyzed,
    Approved,
    Prepared,
    Renamed,
    MetadataGenerated,
    Uploaded,
    Failed,
    Cancelled,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Scanned => "scanned",
            FileStatus::Analyzed => "analyzed",
            FileStatus::Approved => "approved",
            FileStatus::Prepared => "prepared",
            FileStatus::Renamed => "renamed",
            FileStatus::MetadataGenerated => "metadata_generated",
            FileStatus::Uploaded => "uploaded",
            FileStatus::Failed => "failed",
            FileStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => FileStatus::Pending,
            "scanned" => FileStatus::Scanned,
            "analyzed" => FileStatus::Analyzed,
            "approved" => FileStatus::Approved,
            "prepared" => FileStatus::Prepared,
            "renamed" => FileStatus::Renamed,
            "metadata_generated" => FileStatus::MetadataGenerated,
            "uploaded" => FileStatus::Uploaded,
            "failed" => FileStatus::Failed,
            "cancelled" => FileStatus::Cancelled,
            _ => return None,
        })
    }

    /// Position in the forward chain, if the status is on it.
    fn chain_index(self) -> Option<usize> {
        match self {
            FileStatus::Pending => Some(0),
            FileStatus::Scanned => Some(1),
            FileStatus::Analyzed => Some(2),
            FileStatus::Approved => Some(3),
            FileStatus::Prepared => Some(4),
            FileStatus::Renamed => Some(5),
            FileStatus::MetadataGenerated => Some(6),
            FileStatus::Uploaded => Some(7),
            FileStatus::Failed | FileStatus::Cancelled => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FileStatus::Uploaded | FileStatus::Failed | FileStatus::Cancelled
        )
    }

    /// Whether `from -> to` is an allowed transition: one step forward on
    /// the chain, a drop to FAILED/CANCELLED from any non-terminal state,
    /// or a no-op.
    pub fn can_transition(from: FileStatus, to: FileStatus) -> bool {
        if from == to {
            return true;
        }
        match to {
            FileStatus::Failed | FileStatus::Cancelled => !from.is_terminal(),
            _ => match (from.chain_index(), to.chain_index()) {
                (Some(a), Some(b)) => b == a + 1,
                _ => false,
            },
        }
    }
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scan,
    Analyze,
    Approve,
    Prepare,
    Rename,
    Generate,
    Upload,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Scan,
        Stage::Analyze,
        Stage::Approve,
        Stage::Prepare,
        Stage::Rename,
        Stage::Generate,
        Stage::Upload,
    ];

    pub fn checkpoint_column(self) -> &'static str {
        match self {
            Stage::Scan => "scanned_at",
            Stage::Analyze => "analyzed_at",
            Stage::Approve => "approved_at",
            Stage::Prepare => "prepared_at",
            Stage::Rename => "renamed_at",
            Stage::Generate => "metadata_generated_at",
            Stage::Upload => "uploaded_at",
        }
    }

    /// Status the entry holds after this stage completes.
    pub fn completed_status(self) -> FileStatus {
        match self {
            Stage::Scan => FileStatus::Scanned,
            Stage::Analyze => FileStatus::Analyzed,
            Stage::Approve => FileStatus::Approved,
            Stage::Prepare => FileStatus::Prepared,
            Stage::Rename => FileStatus::Renamed,
            Stage::Generate => FileStatus::MetadataGenerated,
            Stage::Upload => FileStatus::Uploaded,
        }
    }

    /// Status required to enter this stage.
    pub fn entry_status(self) -> FileStatus {
        match self {
            Stage::Scan => FileStatus::Pending,
            Stage::Analyze => FileStatus::Scanned,
            Stage::Approve => FileStatus::Analyzed,
            Stage::Prepare => FileStatus::Approved,
            Stage::Rename => FileStatus::Prepared,
            Stage::Generate => FileStatus::Renamed,
            Stage::Upload => FileStatus::MetadataGenerated,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Scan => "scan",
            Stage::Analyze => "analyze",
            Stage::Approve => "approve",
            Stage::Prepare => "prepare",
            Stage::Rename => "rename",
            Stage::Generate => "generate",
            Stage::Upload => "upload",
        }
    }
}

/// Outcome of one tracker within the Upload stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerOutcome {
    Uploaded,
    SkippedDuplicate,
    Failed,
}

impl TrackerOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackerOutcome::Uploaded => "uploaded",
            TrackerOutcome::SkippedDuplicate => "skipped_duplicate",
            TrackerOutcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "uploaded" => TrackerOutcome::Uploaded,
            "skipped_duplicate" => TrackerOutcome::SkippedDuplicate,
            "failed" => TrackerOutcome::Failed,
            _ => return None,
        })
    }
}

/// Per-tracker upload result, owned by its file entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerResult {
    pub tracker_slug: String,
    pub outcome: TrackerOutcome,
    pub remote_torrent_id: Option<String>,
    pub remote_url: Option<String>,
    pub error: Option<String>,
}

/// A file entry row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileEntry {
    pub id: i64,
    pub file_path: String,
    pub status: String,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
    pub release_name: Option<String>,
    pub nfo_path: Option<String>,
    pub torrent_paths: String,
    pub screenshot_urls: String,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scanned_at: Option<DateTime<Utc>>,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub prepared_at: Option<DateTime<Utc>>,
    pub renamed_at: Option<DateTime<Utc>>,
    pub metadata_generated_at: Option<DateTime<Utc>>,
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl FileEntry {
    pub fn file_status(&self) -> FileStatus {
        FileStatus::parse(&self.status).unwrap_or(FileStatus::Pending)
    }

    pub fn checkpoint(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Scan => self.scanned_at,
            Stage::Analyze => self.analyzed_at,
            Stage::Approve => self.approved_at,
            Stage::Prepare => self.prepared_at,
            Stage::Rename => self.renamed_at,
            Stage::Generate => self.metadata_generated_at,
            Stage::Upload => self.uploaded_at,
        }
    }

    /// First stage whose checkpoint is unset, or None when fully processed.
    pub fn next_stage(&self) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .find(|stage| self.checkpoint(*stage).is_none())
    }

    /// Tracker slug -> local path of the generated .torrent.
    pub fn torrent_paths(&self) -> HashMap<String, String> {
        serde_json::from_str(&self.torrent_paths).unwrap_or_default()
    }

    pub fn screenshot_urls(&self) -> Vec<String> {
        serde_json::from_str(&self.screenshot_urls).unwrap_or_default()
    }

    /// Structured TMDB + media analysis blob accumulated by the stages.
    pub fn metadata_json(&self) -> Option<serde_json::Value> {
        self.metadata
            .as_deref()
            .and_then(|m| serde_json::from_str(m).ok())
    }
}

/// Artifact fields written together with a stage checkpoint.
#[derive(Debug, Default, Clone)]
pub struct StageArtifacts {
    pub release_name: Option<String>,
    /// New location after the Rename stage moved the file
    pub file_path: Option<String>,
    pub nfo_path: Option<String>,
    pub torrent_paths: Option<HashMap<String, String>>,
    pub screenshot_urls: Option<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
}

pub struct FileEntryRepository {
    pool: DbPool,
}

impl FileEntryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create an entry for a path, or return the existing one. A FAILED
    /// or CANCELLED entry is reset to PENDING so the file can be
    /// resubmitted from scratch.
    pub async fn create_or_get(&self, file_path: &str) -> Result<FileEntry> {
        if let Some(existing) = self.get_by_path(file_path).await? {
            if matches!(
                existing.file_status(),
                FileStatus::Failed | FileStatus::Cancelled
            ) {
                let now = Utc::now();
                sqlx::query(
                    r#"
                    UPDATE file_entries SET
                        status = 'pending',
                        error_message = NULL,
                        error_kind = NULL,
                        scanned_at = NULL,
                        analyzed_at = NULL,
                        approved_at = NULL,
                        prepared_at = NULL,
                        renamed_at = NULL,
                        metadata_generated_at = NULL,
                        uploaded_at = NULL,
                        torrent_paths = '{}',
                        nfo_path = NULL,
                        updated_at = $2
                    WHERE id = $1
                    "#,
                )
                .bind(existing.id)
                .bind(now)
                .execute(&self.pool)
                .await?;
                return self
                    .get_by_id(existing.id)
                    .await?
                    .context("entry vanished during reset");
            }
            return Ok(existing);
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO file_entries (file_path, status, created_at, updated_at)
            VALUES ($1, 'pending', $2, $2)
            "#,
        )
        .bind(file_path)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_by_id(result.last_insert_rowid())
            .await?
            .context("entry vanished after insert")
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<FileEntry>> {
        let entry = sqlx::query_as::<_, FileEntry>("SELECT * FROM file_entries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    pub async fn get_by_path(&self, file_path: &str) -> Result<Option<FileEntry>> {
        let entry =
            sqlx::query_as::<_, FileEntry>("SELECT * FROM file_entries WHERE file_path = $1")
                .bind(file_path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(entry)
    }

    pub async fn get_by_status(&self, status: FileStatus) -> Result<Vec<FileEntry>> {
        let entries = sqlx::query_as::<_, FileEntry>(
            "SELECT * FROM file_entries WHERE status = $1 ORDER BY id",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Commit a stage: status, checkpoint timestamp and artifacts in one
    /// transaction. Setting an already-set checkpoint is a no-op; an
    /// out-of-order transition is rejected.
    pub async fn update_with_checkpoint(
        &self,
        id: i64,
        stage: Stage,
        artifacts: StageArtifacts,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let entry = sqlx::query_as::<_, FileEntry>("SELECT * FROM file_entries WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .with_context(|| format!("file entry {id} not found"))?;

        if entry.checkpoint(stage).is_some() {
            tx.commit().await?;
            return Ok(());
        }

        let current = entry.file_status();
        let target = stage.completed_status();
        if !FileStatus::can_transition(current, target) {
            bail!(
                "invalid status transition {} -> {} for entry {}",
                current.as_str(),
                target.as_str(),
                id
            );
        }

        let now = Utc::now();
        let torrent_paths = artifacts
            .torrent_paths
            .as_ref()
            .map(|p| serde_json::to_string(p))
            .transpose()?;
        let screenshot_urls = artifacts
            .screenshot_urls
            .as_ref()
            .map(|u| serde_json::to_string(u))
            .transpose()?;
        let metadata = artifacts
            .metadata
            .as_ref()
            .map(|m| serde_json::to_string(m))
            .transpose()?;

        // Checkpoint column is one of a fixed set, never user input
        let sql = format!(
            r#"
            UPDATE file_entries SET
                status = $2,
                {checkpoint} = $3,
                updated_at = $3,
                error_message = NULL,
                error_kind = NULL,
                release_name = COALESCE($4, release_name),
                file_path = COALESCE($5, file_path),
                nfo_path = COALESCE($6, nfo_path),
                torrent_paths = COALESCE($7, torrent_paths),
                screenshot_urls = COALESCE($8, screenshot_urls),
                metadata = COALESCE($9, metadata)
            WHERE id = $1
            "#,
            checkpoint = stage.checkpoint_column()
        );

        sqlx::query(&sql)
            .bind(id)
            .bind(target.as_str())
            .bind(now)
            .bind(artifacts.release_name)
            .bind(artifacts.file_path)
            .bind(artifacts.nfo_path)
            .bind(torrent_paths)
            .bind(screenshot_urls)
            .bind(metadata)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64, kind: ErrorKind, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE file_entries
            SET status = 'failed', error_kind = $2, error_message = $3, updated_at = $4
            WHERE id = $1 AND status NOT IN ('uploaded', 'failed', 'cancelled')
            "#,
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_cancelled(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE file_entries
            SET status = 'cancelled', updated_at = $2
            WHERE id = $1 AND status NOT IN ('uploaded', 'failed', 'cancelled')
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record (or overwrite) the outcome for one tracker.
    pub async fn record_tracker_result(&self, id: i64, result: &TrackerResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tracker_results
                (file_entry_id, tracker_slug, outcome, remote_torrent_id, remote_url, error, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT(file_entry_id, tracker_slug) DO UPDATE SET
                outcome = excluded.outcome,
                remote_torrent_id = excluded.remote_torrent_id,
                remote_url = excluded.remote_url,
                error = excluded.error,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(id)
        .bind(&result.tracker_slug)
        .bind(result.outcome.as_str())
        .bind(&result.remote_torrent_id)
        .bind(&result.remote_url)
        .bind(&result.error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn tracker_results(&self, id: i64) -> Result<Vec<TrackerResult>> {
        let rows = sqlx::query_as::<_, (String, String, Option<String>, Option<String>, Option<String>)>(
            r#"
            SELECT tracker_slug, outcome, remote_torrent_id, remote_url, error
            FROM tracker_results
            WHERE file_entry_id = $1
            ORDER BY tracker_slug
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(slug, outcome, torrent_id, url, error)| {
                Some(TrackerResult {
                    tracker_slug: slug,
                    outcome: TrackerOutcome::parse(&outcome)?,
                    remote_torrent_id: torrent_id,
                    remote_url: url,
                    error,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_chain_transitions() {
        assert!(FileStatus::can_transition(
            FileStatus::Pending,
            FileStatus::Scanned
        ));
        assert!(FileStatus::can_transition(
            FileStatus::MetadataGenerated,
            FileStatus::Uploaded
        ));
        // No jumping forward
        assert!(!FileStatus::can_transition(
            FileStatus::Pending,
            FileStatus::Analyzed
        ));
        // No regression
        assert!(!FileStatus::can_transition(
            FileStatus::Renamed,
            FileStatus::Analyzed
        ));
    }

    #[test]
    fn test_terminal_transitions() {
        assert!(FileStatus::can_transition(
            FileStatus::Analyzed,
            FileStatus::Failed
        ));
        assert!(FileStatus::can_transition(
            FileStatus::Pending,
            FileStatus::Cancelled
        ));
        assert!(!FileStatus::can_transition(
            FileStatus::Uploaded,
            FileStatus::Failed
        ));
        assert!(!FileStatus::can_transition(
            FileStatus::Failed,
            FileStatus::Scanned
        ));
    }

    #[test]
    fn test_stage_order_matches_status_chain() {
        for stage in Stage::ALL {
            assert!(FileStatus::can_transition(
                stage.entry_status(),
                stage.completed_status()
            ));
        }
    }
}
