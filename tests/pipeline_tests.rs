//! Integration tests for the publication pipeline
//!
//! These verify the durable core against a real (in-memory) database:
//! - File entry status transitions and checkpoint idempotence
//! - Queue dispatch order, claim semantics and retry accounting
//! - Crash recovery (stale RUNNING reset)
//! - Batch progress roll-up

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::sqlite::SqlitePoolOptions;

use seedforge::db::{
    self, BatchOutcome, BatchRepository, DbPool, FileEntryRepository, FileStatus, JobPriority,
    QueueRepository, RequeueResult, Stage, StageArtifacts, TrackerOutcome, TrackerResult,
};
use seedforge::error::ErrorKind;

async fn test_pool() -> DbPool {
    // A single connection keeps every query on the same in-memory db
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory database");
    db::sync_schema(&pool).await.expect("schema sync failed");
    pool
}

// ============================================================================
// File entry checkpoints
// ============================================================================

mod file_entries {
    use super::*;

    #[tokio::test]
    async fn test_stages_commit_in_order() {
        let pool = test_pool().await;
        let repo = FileEntryRepository::new(pool);

        let entry = repo.create_or_get("/in/The.Movie.2021.mkv").await.unwrap();
        assert_eq!(entry.file_status(), FileStatus::Pending);
        assert_eq!(entry.next_stage(), Some(Stage::Scan));

        for stage in Stage::ALL {
            repo.update_with_checkpoint(entry.id, stage, StageArtifacts::default())
                .await
                .unwrap();
        }

        let done = repo.get_by_id(entry.id).await.unwrap().unwrap();
        assert_eq!(done.file_status(), FileStatus::Uploaded);
        assert_eq!(done.next_stage(), None);

        // Every checkpoint set, non-decreasing
        let mut last = None;
        for stage in Stage::ALL {
            let ts = done.checkpoint(stage).expect("checkpoint missing");
            if let Some(prev) = last {
                assert!(ts >= prev, "checkpoints regressed at {}", stage.name());
            }
            last = Some(ts);
        }
    }

    #[tokio::test]
    async fn test_skipping_a_stage_is_rejected() {
        let pool = test_pool().await;
        let repo = FileEntryRepository::new(pool);
        let entry = repo.create_or_get("/in/movie.mkv").await.unwrap();

        // Upload straight from PENDING must not pass
        let result = repo
            .update_with_checkpoint(entry.id, Stage::Upload, StageArtifacts::default())
            .await;
        assert!(result.is_err());

        let unchanged = repo.get_by_id(entry.id).await.unwrap().unwrap();
        assert_eq!(unchanged.file_status(), FileStatus::Pending);
        assert!(unchanged.uploaded_at.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_is_written_exactly_once() {
        let pool = test_pool().await;
        let repo = FileEntryRepository::new(pool);
        let entry = repo.create_or_get("/in/movie.mkv").await.unwrap();

        repo.update_with_checkpoint(
            entry.id,
            Stage::Scan,
            StageArtifacts {
                metadata: Some(serde_json::json!({"parsed": {"title": "Movie"}})),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let first = repo.get_by_id(entry.id).await.unwrap().unwrap();
        let original_ts = first.scanned_at.unwrap();
        let original_meta = first.metadata.clone();

        // Second commit of the same stage is a no-op
        tokio::time::sleep(Duration::from_millis(10)).await;
        repo.update_with_checkpoint(
            entry.id,
            Stage::Scan,
            StageArtifacts {
                metadata: Some(serde_json::json!({"parsed": {"title": "Other"}})),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let second = repo.get_by_id(entry.id).await.unwrap().unwrap();
        assert_eq!(second.scanned_at.unwrap(), original_ts);
        assert_eq!(second.metadata, original_meta);
    }

    #[tokio::test]
    async fn test_resume_points_at_first_unset_checkpoint() {
        let pool = test_pool().await;
        let repo = FileEntryRepository::new(pool);
        let entry = repo.create_or_get("/in/movie.mkv").await.unwrap();

        for stage in [
            Stage::Scan,
            Stage::Analyze,
            Stage::Approve,
            Stage::Prepare,
            Stage::Rename,
            Stage::Generate,
        ] {
            repo.update_with_checkpoint(entry.id, stage, StageArtifacts::default())
                .await
                .unwrap();
        }

        let resumed = repo.get_by_id(entry.id).await.unwrap().unwrap();
        assert_eq!(resumed.file_status(), FileStatus::MetadataGenerated);
        assert_eq!(resumed.next_stage(), Some(Stage::Upload));
    }

    #[tokio::test]
    async fn test_failed_entry_is_reset_on_resubmission() {
        let pool = test_pool().await;
        let repo = FileEntryRepository::new(pool);
        let entry = repo.create_or_get("/in/movie.mkv").await.unwrap();

        repo.update_with_checkpoint(entry.id, Stage::Scan, StageArtifacts::default())
            .await
            .unwrap();
        repo.mark_failed(entry.id, ErrorKind::TrackerPermanent, "rejected")
            .await
            .unwrap();

        let failed = repo.get_by_id(entry.id).await.unwrap().unwrap();
        assert_eq!(failed.file_status(), FileStatus::Failed);
        assert_eq!(failed.error_kind.as_deref(), Some("tracker_permanent"));

        let reset = repo.create_or_get("/in/movie.mkv").await.unwrap();
        assert_eq!(reset.id, entry.id);
        assert_eq!(reset.file_status(), FileStatus::Pending);
        assert!(reset.scanned_at.is_none());
        assert!(reset.error_message.is_none());
    }

    #[tokio::test]
    async fn test_terminal_entry_cannot_fail_again() {
        let pool = test_pool().await;
        let repo = FileEntryRepository::new(pool);
        let entry = repo.create_or_get("/in/movie.mkv").await.unwrap();

        for stage in Stage::ALL {
            repo.update_with_checkpoint(entry.id, stage, StageArtifacts::default())
                .await
                .unwrap();
        }

        repo.mark_failed(entry.id, ErrorKind::NetworkTransient, "late error")
            .await
            .unwrap();
        let entry = repo.get_by_id(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.file_status(), FileStatus::Uploaded);
    }

    #[tokio::test]
    async fn test_tracker_results_upsert_per_slug() {
        let pool = test_pool().await;
        let repo = FileEntryRepository::new(pool);
        let entry = repo.create_or_get("/in/movie.mkv").await.unwrap();

        repo.record_tracker_result(
            entry.id,
            &TrackerResult {
                tracker_slug: "demo".into(),
                outcome: TrackerOutcome::Failed,
                remote_torrent_id: None,
                remote_url: None,
                error: Some("timeout".into()),
            },
        )
        .await
        .unwrap();

        // A later retry overwrites the failure with success
        repo.record_tracker_result(
            entry.id,
            &TrackerResult {
                tracker_slug: "demo".into(),
                outcome: TrackerOutcome::Uploaded,
                remote_torrent_id: Some("4242".into()),
                remote_url: Some("https://demo.example/torrent/4242".into()),
                error: None,
            },
        )
        .await
        .unwrap();

        let results = repo.tracker_results(entry.id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, TrackerOutcome::Uploaded);
        assert_eq!(results[0].remote_torrent_id.as_deref(), Some("4242"));
    }
}

// ============================================================================
// Persistent queue
// ============================================================================

mod queue {
    use super::*;

    async fn entry_id(repo: &FileEntryRepository, path: &str) -> i64 {
        repo.create_or_get(path).await.unwrap().id
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_entry() {
        let pool = test_pool().await;
        let entries = FileEntryRepository::new(pool.clone());
        let queue = QueueRepository::new(pool);

        let id = entry_id(&entries, "/in/a.mkv").await;
        let first = queue
            .enqueue(id, JobPriority::Normal, None, 3, None)
            .await
            .unwrap();
        let second = queue
            .enqueue(id, JobPriority::High, None, 3, None)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_dispatch_order_priority_then_schedule_then_id() {
        let pool = test_pool().await;
        let entries = FileEntryRepository::new(pool.clone());
        let queue = QueueRepository::new(pool);

        let past = Utc::now() - ChronoDuration::seconds(60);
        let earlier = Utc::now() - ChronoDuration::seconds(120);

        let low = entry_id(&entries, "/in/low.mkv").await;
        let normal = entry_id(&entries, "/in/normal.mkv").await;
        let high_late = entry_id(&entries, "/in/high-late.mkv").await;
        let high_early = entry_id(&entries, "/in/high-early.mkv").await;

        queue
            .enqueue(low, JobPriority::Low, Some(earlier), 3, None)
            .await
            .unwrap();
        queue
            .enqueue(normal, JobPriority::Normal, Some(earlier), 3, None)
            .await
            .unwrap();
        queue
            .enqueue(high_late, JobPriority::High, Some(past), 3, None)
            .await
            .unwrap();
        queue
            .enqueue(high_early, JobPriority::High, Some(earlier), 3, None)
            .await
            .unwrap();

        let order: Vec<i64> = {
            let mut order = Vec::new();
            while let Some(job) = queue.claim("w1").await.unwrap() {
                order.push(job.file_entry_id);
            }
            order
        };
        assert_eq!(order, vec![high_early, high_late, normal, low]);
    }

    #[tokio::test]
    async fn test_future_scheduled_jobs_are_not_claimed() {
        let pool = test_pool().await;
        let entries = FileEntryRepository::new(pool.clone());
        let queue = QueueRepository::new(pool);

        let id = entry_id(&entries, "/in/later.mkv").await;
        let future = Utc::now() + ChronoDuration::seconds(3600);
        queue
            .enqueue(id, JobPriority::High, Some(future), 3, None)
            .await
            .unwrap();

        assert!(queue.claim("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claimed_job_cannot_be_claimed_twice() {
        let pool = test_pool().await;
        let entries = FileEntryRepository::new(pool.clone());
        let queue = QueueRepository::new(pool);

        let id = entry_id(&entries, "/in/a.mkv").await;
        queue
            .enqueue(id, JobPriority::Normal, None, 3, None)
            .await
            .unwrap();

        let job = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(job.state, "running");
        assert_eq!(job.claimed_by.as_deref(), Some("w1"));
        assert!(queue.claim("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requeue_counts_attempts_and_exhausts() {
        let pool = test_pool().await;
        let entries = FileEntryRepository::new(pool.clone());
        let queue = QueueRepository::new(pool);

        let id = entry_id(&entries, "/in/a.mkv").await;
        let job_id = queue
            .enqueue(id, JobPriority::Normal, None, 3, None)
            .await
            .unwrap();

        // attempt 0 -> 1
        queue.claim("w1").await.unwrap().unwrap();
        let result = queue
            .requeue(job_id, Duration::from_secs(0), "reset by peer")
            .await
            .unwrap();
        assert!(matches!(result, RequeueResult::Requeued { attempt: 1, .. }));

        // attempt 1 -> 2
        queue.claim("w1").await.unwrap().unwrap();
        let result = queue
            .requeue(job_id, Duration::from_secs(0), "reset by peer")
            .await
            .unwrap();
        assert!(matches!(result, RequeueResult::Requeued { attempt: 2, .. }));

        // attempt 2 -> max reached, job fails
        queue.claim("w1").await.unwrap().unwrap();
        let result = queue
            .requeue(job_id, Duration::from_secs(0), "reset by peer")
            .await
            .unwrap();
        assert!(matches!(result, RequeueResult::Exhausted));

        let job = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, "failed");
        assert_eq!(job.last_error.as_deref(), Some("reset by peer"));
    }

    #[tokio::test]
    async fn test_stale_running_jobs_reset_on_startup() {
        let pool = test_pool().await;
        let entries = FileEntryRepository::new(pool.clone());
        let queue = QueueRepository::new(pool.clone());

        let id = entry_id(&entries, "/in/crashed.mkv").await;
        let job_id = queue
            .enqueue(id, JobPriority::Normal, None, 3, None)
            .await
            .unwrap();
        queue.claim("w1").await.unwrap().unwrap();

        // Simulate a claim from a process that died ten minutes ago
        let stale = Utc::now() - ChronoDuration::seconds(600);
        sqlx::query("UPDATE queue_jobs SET started_at = $1 WHERE id = $2")
            .bind(stale)
            .bind(job_id)
            .execute(&pool)
            .await
            .unwrap();

        let reset = queue
            .reset_stale_running(Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(reset, 1);

        let job = queue.claim("w2").await.unwrap().unwrap();
        assert_eq!(job.id, job_id);
    }

    #[tokio::test]
    async fn test_fresh_running_jobs_survive_reset() {
        let pool = test_pool().await;
        let entries = FileEntryRepository::new(pool.clone());
        let queue = QueueRepository::new(pool);

        let id = entry_id(&entries, "/in/active.mkv").await;
        queue
            .enqueue(id, JobPriority::Normal, None, 3, None)
            .await
            .unwrap();
        queue.claim("w1").await.unwrap().unwrap();

        let reset = queue
            .reset_stale_running(Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(reset, 0);
    }

    #[tokio::test]
    async fn test_statistics_and_cleanup() {
        let pool = test_pool().await;
        let entries = FileEntryRepository::new(pool.clone());
        let queue = QueueRepository::new(pool.clone());

        let a = entry_id(&entries, "/in/a.mkv").await;
        let b = entry_id(&entries, "/in/b.mkv").await;

        let job_a = queue.enqueue(a, JobPriority::Normal, None, 3, None).await.unwrap();
        let job_b = queue.enqueue(b, JobPriority::Normal, None, 3, None).await.unwrap();

        queue.claim("w1").await.unwrap().unwrap();
        queue.complete(job_a).await.unwrap();
        queue.claim("w1").await.unwrap().unwrap();
        queue.fail(job_b, "permanent rejection").await.unwrap();

        let stats = queue.statistics().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.done, 1);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 50.0).abs() < f64::EPSILON);

        // Done jobs older than the horizon are removed
        let old = Utc::now() - ChronoDuration::hours(48);
        sqlx::query("UPDATE queue_jobs SET finished_at = $1 WHERE id = $2")
            .bind(old)
            .bind(job_a)
            .execute(&pool)
            .await
            .unwrap();
        let removed = queue
            .clear_completed(Duration::from_secs(24 * 3600))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}

// ============================================================================
// Batches
// ============================================================================

mod batches {
    use super::*;

    #[tokio::test]
    async fn test_batch_outcomes_roll_up() {
        let pool = test_pool().await;
        let batches = BatchRepository::new(pool);

        let batch_id = batches.create(3, JobPriority::Normal, 2).await.unwrap();

        let progress = batches
            .record_outcome(batch_id, BatchOutcome::Completed)
            .await
            .unwrap();
        assert_eq!(progress.completed, 1);
        assert!(!progress.is_finished());
        assert_eq!(progress.batch_status(), db::BatchStatus::Running);

        batches
            .record_outcome(batch_id, BatchOutcome::Failed)
            .await
            .unwrap();
        let done = batches
            .record_outcome(batch_id, BatchOutcome::Cancelled)
            .await
            .unwrap();

        assert!(done.is_finished());
        assert_eq!(done.batch_status(), db::BatchStatus::Completed);
        assert_eq!(done.completed, 1);
        assert_eq!(done.failed, 1);
        assert_eq!(done.cancelled, 1);
    }

    #[tokio::test]
    async fn test_batch_concurrency_limit_holds_back_claims() {
        let pool = test_pool().await;
        let entries = FileEntryRepository::new(pool.clone());
        let queue = QueueRepository::new(pool.clone());
        let batches = BatchRepository::new(pool);

        let batch_id = batches.create(3, JobPriority::Normal, 1).await.unwrap();
        for path in ["/in/a.mkv", "/in/b.mkv", "/in/c.mkv"] {
            let id = entries.create_or_get(path).await.unwrap().id;
            queue
                .enqueue(id, JobPriority::Normal, None, 3, Some(batch_id))
                .await
                .unwrap();
        }

        // Cap of one: a second claim yields nothing while one runs
        let first = queue.claim("w1").await.unwrap();
        assert!(first.is_some());
        assert!(queue.claim("w2").await.unwrap().is_none());

        // Finishing the first frees the next
        queue.complete(first.unwrap().id).await.unwrap();
        assert!(queue.claim("w2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_batch_cancel_cascades_to_queued_jobs() {
        let pool = test_pool().await;
        let entries = FileEntryRepository::new(pool.clone());
        let queue = QueueRepository::new(pool.clone());
        let batches = BatchRepository::new(pool);

        let batch_id = batches.create(2, JobPriority::Normal, 2).await.unwrap();
        for path in ["/in/a.mkv", "/in/b.mkv"] {
            let id = entries.create_or_get(path).await.unwrap().id;
            queue
                .enqueue(id, JobPriority::Normal, None, 3, Some(batch_id))
                .await
                .unwrap();
        }

        let cancelled = queue.cancel_queued_for_batch(batch_id).await.unwrap();
        assert_eq!(cancelled, 2);
        assert!(queue.claim("w1").await.unwrap().is_none());
    }
}
