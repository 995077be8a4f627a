//! Database layer
//!
//! SQLite via sqlx is the single source of truth for file entries, the
//! job queue, batches, tracker configuration and the TMDB cache.
//! Filesystem artifacts are deliberately not transactional with the
//! database; stage postconditions are verifiable on disk so a crash
//! between a write and its commit is recovered by re-running the stage.

pub mod batches;
pub mod file_entries;
pub mod queue;
pub mod tmdb_cache;
pub mod trackers;

pub use batches::{BatchJob, BatchOutcome, BatchRepository, BatchStatus};
pub use file_entries::{
    FileEntry, FileEntryRepository, FileStatus, Stage, StageArtifacts, TrackerOutcome,
    TrackerResult,
};
pub use queue::{JobPriority, JobState, QueueJob, QueueRepository, QueueStatistics, RequeueResult};
pub use tmdb_cache::TmdbCacheRepository;
pub use trackers::{TrackerRecord, TrackerRepository};

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::time::sleep;
use tracing::warn;

pub type DbPool = sqlx::SqlitePool;

/// Ensure the parent directory of the database path exists.
/// No-op for in-memory or empty paths.
fn ensure_database_parent_dir(opts: &SqliteConnectOptions) -> Result<()> {
    let path = opts.get_filename();
    if path.as_os_str().is_empty() || path == Path::new(":memory:") {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("Failed to create database directory {:?}: {}", parent, e)
            })?;
        }
    }
    Ok(())
}

/// Connect with retries, creating the database file and parent directory
/// if they do not exist.
pub async fn connect_with_retry(url: &str, timeout: Duration) -> Result<DbPool> {
    let opts = url
        .parse::<SqliteConnectOptions>()
        .map_err(|e| anyhow::anyhow!("Invalid database URL: {}", e))?;
    ensure_database_parent_dir(&opts)?;
    let opts = opts.create_if_missing(true);

    let start = Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts.clone())
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) => {
                if start.elapsed() >= timeout {
                    anyhow::bail!(
                        "Database connection failed after {:?} (attempt {}): {}",
                        timeout,
                        attempt,
                        e
                    );
                }
                warn!(attempt = attempt, error = %e, "Database not ready, retrying in 1s");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Idempotent schema creation. Statements are `IF NOT EXISTS` so the call
/// is safe on every startup.
pub async fn sync_schema(pool: &DbPool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS file_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            error_kind TEXT,
            release_name TEXT,
            nfo_path TEXT,
            torrent_paths TEXT NOT NULL DEFAULT '{}',
            screenshot_urls TEXT NOT NULL DEFAULT '[]',
            metadata TEXT,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            scanned_at DATETIME,
            analyzed_at DATETIME,
            approved_at DATETIME,
            prepared_at DATETIME,
            renamed_at DATETIME,
            metadata_generated_at DATETIME,
            uploaded_at DATETIME
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tracker_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_entry_id INTEGER NOT NULL REFERENCES file_entries(id),
            tracker_slug TEXT NOT NULL,
            outcome TEXT NOT NULL,
            remote_torrent_id TEXT,
            remote_url TEXT,
            error TEXT,
            recorded_at DATETIME NOT NULL,
            UNIQUE(file_entry_id, tracker_slug)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS queue_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_entry_id INTEGER NOT NULL REFERENCES file_entries(id),
            batch_id INTEGER REFERENCES batch_jobs(id),
            priority TEXT NOT NULL DEFAULT 'normal',
            state TEXT NOT NULL DEFAULT 'queued',
            attempt INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            scheduled_at DATETIME NOT NULL,
            started_at DATETIME,
            finished_at DATETIME,
            last_error TEXT,
            claimed_by TEXT,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_queue_jobs_dispatch
            ON queue_jobs(state, scheduled_at)
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_queue_jobs_entry
            ON queue_jobs(file_entry_id, state)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS batch_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            status TEXT NOT NULL DEFAULT 'pending',
            priority TEXT NOT NULL DEFAULT 'normal',
            concurrency_limit INTEGER NOT NULL DEFAULT 2,
            total INTEGER NOT NULL DEFAULT 0,
            completed INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            cancelled INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tmdb_cache (
            tmdb_id INTEGER PRIMARY KEY,
            payload TEXT NOT NULL,
            cached_at DATETIME NOT NULL,
            expires_at DATETIME NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS trackers (
            slug TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            schema_yaml TEXT NOT NULL,
            api_key TEXT,
            passkey TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
