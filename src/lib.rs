//! Seedforge - automated publication of media releases to private
//! BitTorrent trackers
//!
//! The core is a checkpointed, resumable pipeline (scan, analyze,
//! approve, prepare, rename, generate, upload) driven by a durable job
//! queue, plus a tracker layer where every tracker is described by a
//! declarative schema instead of code. The embedding program supplies a
//! [`config::Config`] and receives progress through the event sink; it
//! owns argument parsing, HTTP surfaces and notification fan-out.

pub mod batch;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod services;
pub mod tracker;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::batch::BatchController;
use crate::config::Config;
use crate::db::{
    BatchRepository, DbPool, FileEntryRepository, JobPriority, QueueRepository,
    TmdbCacheRepository, TrackerRepository,
};
use crate::events::EventSink;
use crate::pipeline::{Pipeline, PipelineServices};
use crate::services::flaresolverr::FlareSolverrClient;
use crate::services::image_host::ImageHostClient;
use crate::services::media_analyzer::MediaAnalyzer;
use crate::services::nfo::PlainTextRenderer;
use crate::services::qbittorrent::QbittorrentClient;
use crate::services::renamer::Renamer;
use crate::services::screenshots::ScreenshotGenerator;
use crate::services::tmdb::TmdbClient;
use crate::services::torrent_builder::TorrentBuilder;
use crate::services::ServiceRegistry;
use crate::tracker::TrackerAdapter;
use crate::worker::{QueueWorker, WorkerConfig};

/// The assembled application: database, services, pipeline and worker.
pub struct App {
    pool: DbPool,
    config: Config,
    events: EventSink,
    pipeline: Arc<Pipeline>,
    worker: Arc<QueueWorker>,
    batch: BatchController,
    queue: QueueRepository,
    entries: FileEntryRepository,
}

impl App {
    /// Wire everything up from configuration: connect and migrate the
    /// database, build the service registry, sync tracker schemas and
    /// construct the pipeline and worker.
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let pool = db::connect_with_retry(&config.database_url, Duration::from_secs(30))
            .await
            .context("database connection failed")?;
        db::sync_schema(&pool).await.context("schema sync failed")?;
        info!("Database ready");

        let registry = Arc::new(
            ServiceRegistry::new()
                .with_rate_limits(&config.rate_limits)
                .await,
        );
        let events = EventSink::default();

        let flaresolverr = config.flaresolverr_url.clone().map(|url| {
            Arc::new(FlareSolverrClient::new(
                url,
                config.flaresolverr_timeout_ms,
                registry.clone(),
            ))
        });

        // Tracker schemas from configuration are the source of truth;
        // the table mirrors them for dashboards and credential edits
        let tracker_repo = TrackerRepository::new(pool.clone());
        let mut adapters = Vec::new();
        for entry in &config.trackers {
            let schema = tracker::load_schema(&entry.schema_yaml)
                .context("invalid tracker schema")?;
            tracker_repo
                .upsert(
                    &schema.tracker.slug,
                    &schema.tracker.name,
                    &entry.schema_yaml,
                    entry.api_key.as_deref(),
                    entry.passkey.as_deref(),
                    entry.enabled,
                )
                .await?;

            if entry.enabled {
                let adapter = Arc::new(TrackerAdapter::new(
                    schema,
                    entry.api_key.clone(),
                    entry.passkey.clone(),
                    registry.clone(),
                    flaresolverr.clone(),
                ));
                adapter.register_rate_limits().await;
                info!(tracker = adapter.slug(), "Tracker enabled");
                adapters.push(adapter);
            }
        }

        let tmdb = config.tmdb_api_key.clone().map(|key| {
            TmdbClient::new(
                key,
                TmdbCacheRepository::new(pool.clone()),
                registry.clone(),
                config.tmdb_cache_ttl_days,
            )
        });

        let image_host = config.image_host.clone().map(|c| {
            ImageHostClient::new(c.upload_url, c.api_key, registry.clone())
        });

        let seed_category = config.seed_client.as_ref().and_then(|c| c.category.clone());
        let seed_client = config.seed_client.clone().map(|c| {
            QbittorrentClient::new(c.base_url, c.username, c.password, registry.clone())
        });

        let prowlarr = config.prowlarr.clone().map(|c| {
            crate::services::prowlarr::ProwlarrClient::new(c.base_url, c.api_key, registry.clone())
        });

        let services = Arc::new(PipelineServices {
            entries: FileEntryRepository::new(pool.clone()),
            registry: registry.clone(),
            tmdb,
            analyzer: MediaAnalyzer::default(),
            screenshots: ScreenshotGenerator::default(),
            image_host,
            seed_client,
            seed_category,
            prowlarr,
            renderer: Arc::new(PlainTextRenderer),
            renamer: Renamer::new(
                config.input_media_path.clone(),
                config.output_dir.clone(),
            ),
            torrent_builder: TorrentBuilder::new(config.output_dir.clone()),
            adapters,
            events: events.clone(),
            approval_policy: config.approval_policy,
            require_all_trackers: config.require_all_trackers,
            screenshot_count: config.screenshot_count,
        });

        let pipeline = Arc::new(Pipeline::new(services));
        let queue = QueueRepository::new(pool.clone());
        let worker = Arc::new(QueueWorker::new(
            QueueRepository::new(pool.clone()),
            BatchRepository::new(pool.clone()),
            pipeline.clone(),
            events.clone(),
            WorkerConfig {
                concurrency: config.worker_concurrency.max(1),
                poll_interval: config.poll_interval,
                stale_running_grace: config.stale_running_grace,
                ..Default::default()
            },
        ));

        let batch = BatchController::new(
            QueueRepository::new(pool.clone()),
            BatchRepository::new(pool.clone()),
            FileEntryRepository::new(pool.clone()),
            config.max_attempts,
        );

        Ok(Self {
            entries: FileEntryRepository::new(pool.clone()),
            pool,
            config,
            events,
            pipeline,
            worker,
            batch,
            queue,
        })
    }

    /// Start the worker loop; returns its join handle.
    pub fn start_worker(&self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.worker.clone().run())
    }

    /// Register a media file and enqueue it. Returns the entry and job
    /// ids; an already-active file returns its existing job unchanged.
    pub async fn submit_file(&self, file_path: &str, priority: JobPriority) -> Result<(i64, i64)> {
        let entry = self.entries.create_or_get(file_path).await?;
        let job_id = self
            .queue
            .enqueue(entry.id, priority, None, self.config.max_attempts, None)
            .await?;
        Ok((entry.id, job_id))
    }

    /// Record a manual approval and put the entry back on the queue.
    pub async fn approve_entry(&self, entry_id: i64, priority: JobPriority) -> Result<i64> {
        self.pipeline
            .approve_entry(entry_id)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let job_id = self
            .queue
            .enqueue(entry_id, priority, None, self.config.max_attempts, None)
            .await?;
        Ok(job_id)
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        self.pipeline.clone()
    }

    pub fn worker(&self) -> Arc<QueueWorker> {
        self.worker.clone()
    }

    pub fn batches(&self) -> &BatchController {
        &self.batch
    }

    pub fn queue(&self) -> &QueueRepository {
        &self.queue
    }

    pub fn entries(&self) -> &FileEntryRepository {
        &self.entries
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
