//! File processing pipeline
//!
//! Advances a file entry through the stage sequence, consulting the
//! checkpoint timestamps so completed stages are never re-run. Each
//! stage commits its status, checkpoint and artifacts in one database
//! transaction; a retry after a failure inside a stage restarts only
//! that stage.
//!
//! Stage order: Scan, Analyze, Approve, Prepare, Rename, Generate,
//! Upload. Failures are classified; the queue worker decides between
//! requeue-with-backoff and terminal failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ApprovalPolicy;
use crate::db::{
    FileEntry, FileEntryRepository, Stage, StageArtifacts, TrackerOutcome, TrackerResult,
};
use crate::error::PipelineError;
use crate::events::{EventSink, PipelineEvent};
use crate::services::filename_parser::{parse_release, ParsedRelease};
use crate::services::image_host::ImageHostClient;
use crate::services::media_analyzer::{MediaAnalyzer, MediaInfo};
use crate::services::nfo::{PresentationContext, PresentationRenderer};
use crate::services::prowlarr::ProwlarrClient;
use crate::services::qbittorrent::QbittorrentClient;
use crate::services::registry::ServiceRegistry;
use crate::services::renamer::Renamer;
use crate::services::screenshots::ScreenshotGenerator;
use crate::services::tmdb::{MovieMetadata, TmdbClient};
use crate::services::torrent_builder::TorrentBuilder;
use crate::tracker::adapter::{DuplicateQuery, FilePayload, TrackerAdapter, UploadContext};
use crate::tracker::options::OptionInputs;

/// Everything the stages need, wired once at startup.
pub struct PipelineServices {
    pub entries: FileEntryRepository,
    pub registry: Arc<ServiceRegistry>,
    pub tmdb: Option<TmdbClient>,
    pub analyzer: MediaAnalyzer,
    pub screenshots: ScreenshotGenerator,
    pub image_host: Option<ImageHostClient>,
    pub seed_client: Option<QbittorrentClient>,
    pub seed_category: Option<String>,
    pub prowlarr: Option<ProwlarrClient>,
    pub renderer: Arc<dyn PresentationRenderer>,
    pub renamer: Renamer,
    pub torrent_builder: TorrentBuilder,
    pub adapters: Vec<Arc<TrackerAdapter>>,
    pub events: EventSink,
    pub approval_policy: ApprovalPolicy,
    pub require_all_trackers: bool,
    pub screenshot_count: u32,
}

/// Result of driving an entry as far as it can go in one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineRun {
    /// All stages complete; the entry is UPLOADED
    Finished,
    /// Manual approval policy stopped the run at ANALYZED
    AwaitingApproval,
}

enum StageOutcome {
    Committed,
    AwaitingApproval,
}

pub struct Pipeline {
    services: Arc<PipelineServices>,
}

impl Pipeline {
    pub fn new(services: Arc<PipelineServices>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &PipelineServices {
        &self.services
    }

    /// Run every remaining stage for an entry, in order, within the
    /// caller's job claim. Cancellation is checked at stage boundaries.
    pub async fn process_entry(
        &self,
        entry_id: i64,
        cancel: &CancellationToken,
    ) -> Result<PipelineRun, PipelineError> {
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let entry = self.load_entry(entry_id).await?;
            let status = entry.file_status();
            if status == crate::db::FileStatus::Failed
                || status == crate::db::FileStatus::Cancelled
            {
                return Err(PipelineError::Invariant(format!(
                    "entry {entry_id} is terminal ({})",
                    status.as_str()
                )));
            }

            let Some(stage) = entry.next_stage() else {
                return Ok(PipelineRun::Finished);
            };

            debug!(entry_id = entry_id, stage = stage.name(), "Entering stage");
            let outcome = match stage {
                Stage::Scan => self.scan_stage(&entry).await?,
                Stage::Analyze => self.analyze_stage(&entry, cancel).await?,
                Stage::Approve => self.approve_stage(&entry).await?,
                Stage::Prepare => self.prepare_stage(&entry, cancel).await?,
                Stage::Rename => self.rename_stage(&entry).await?,
                Stage::Generate => self.generate_stage(&entry).await?,
                Stage::Upload => self.upload_stage(&entry, cancel).await?,
            };

            match outcome {
                StageOutcome::Committed => {
                    info!(entry_id = entry_id, stage = stage.name(), "Stage completed");
                    self.services.events.emit(PipelineEvent::FileEntryProgressed {
                        entry_id,
                        status: stage.completed_status(),
                    });
                }
                StageOutcome::AwaitingApproval => {
                    info!(entry_id = entry_id, "Entry awaiting manual approval");
                    return Ok(PipelineRun::AwaitingApproval);
                }
            }
        }
    }

    /// Record a manual approval. The caller re-enqueues the entry.
    pub async fn approve_entry(&self, entry_id: i64) -> Result<(), PipelineError> {
        self.services
            .entries
            .update_with_checkpoint(entry_id, Stage::Approve, StageArtifacts::default())
            .await
            .map_err(db_error)
    }

    async fn load_entry(&self, entry_id: i64) -> Result<FileEntry, PipelineError> {
        self.services
            .entries
            .get_by_id(entry_id)
            .await
            .map_err(db_error)?
            .ok_or_else(|| PipelineError::Invariant(format!("file entry {entry_id} not found")))
    }

    async fn commit(
        &self,
        entry: &FileEntry,
        stage: Stage,
        artifacts: StageArtifacts,
    ) -> Result<StageOutcome, PipelineError> {
        self.services
            .entries
            .update_with_checkpoint(entry.id, stage, artifacts)
            .await
            .map_err(db_error)?;
        Ok(StageOutcome::Committed)
    }

    // ------------------------------------------------------------------
    // Scan
    // ------------------------------------------------------------------

    /// Verify the file exists and is readable, then extract the scene
    /// tokens from its name.
    async fn scan_stage(&self, entry: &FileEntry) -> Result<StageOutcome, PipelineError> {
        let path = Path::new(&entry.file_path);
        self.services.renamer.ensure_within_roots(path)?;

        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            PipelineError::Validation(format!(
                "file '{}' is not readable: {e}",
                path.display()
            ))
        })?;
        if !metadata.is_file() {
            return Err(PipelineError::Validation(format!(
                "'{}' is not a regular file",
                path.display()
            )));
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| entry.file_path.clone());
        let parsed = parse_release(&filename);

        let artifacts = StageArtifacts {
            metadata: Some(merge_metadata(entry, "parsed", json!(parsed))),
            ..Default::default()
        };
        self.commit(entry, Stage::Scan, artifacts).await
    }

    // ------------------------------------------------------------------
    // Analyze
    // ------------------------------------------------------------------

    /// Run media analysis and resolve TMDB metadata (cache-first) from
    /// the title/year guess.
    async fn analyze_stage(
        &self,
        entry: &FileEntry,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome, PipelineError> {
        let path = Path::new(&entry.file_path);

        let media = match self.services.analyzer.analyze(path).await {
            Ok(media) => media,
            Err(e) => {
                return if self.services.analyzer.is_available().await {
                    Err(PipelineError::Validation(format!("media analysis failed: {e}")))
                } else {
                    Err(PipelineError::ExternalUnavailable(
                        "mediainfo tool is not available".into(),
                    ))
                };
            }
        };

        let parsed: Option<ParsedRelease> = metadata_section(entry, "parsed");
        let mut merged = merge_metadata(entry, "media", json!(media));

        if let Some(tmdb) = &self.services.tmdb {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let title = parsed.as_ref().and_then(|p| p.title.clone());
            let year = parsed.as_ref().and_then(|p| p.year);

            if let Some(title) = title {
                let hits = tmdb.search_movie(&title, year, cancel).await?;
                match hits.first() {
                    Some(hit) => {
                        let movie = tmdb.get_movie(hit.tmdb_id, cancel).await?;
                        merged = merge_value(merged, "tmdb", json!(movie));
                    }
                    None => {
                        warn!(
                            entry_id = entry.id,
                            title = %title,
                            "No TMDB match for title guess"
                        );
                    }
                }
            } else {
                warn!(entry_id = entry.id, "No title guess, skipping TMDB lookup");
            }
        }

        let artifacts = StageArtifacts {
            metadata: Some(merged),
            ..Default::default()
        };
        self.commit(entry, Stage::Analyze, artifacts).await
    }

    // ------------------------------------------------------------------
    // Approve
    // ------------------------------------------------------------------

    async fn approve_stage(&self, entry: &FileEntry) -> Result<StageOutcome, PipelineError> {
        match self.services.approval_policy {
            ApprovalPolicy::Auto => {
                self.commit(entry, Stage::Approve, StageArtifacts::default())
                    .await
            }
            ApprovalPolicy::Manual => Ok(StageOutcome::AwaitingApproval),
        }
    }

    // ------------------------------------------------------------------
    // Prepare
    // ------------------------------------------------------------------

    /// Capture screenshots and push them to the image host. Both the
    /// capture tool and the host are optional; their absence skips the
    /// step rather than failing the file.
    async fn prepare_stage(
        &self,
        entry: &FileEntry,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome, PipelineError> {
        let mut screenshot_urls = Vec::new();

        let want_screenshots = self.services.screenshot_count > 0
            && self.services.image_host.is_some()
            && self.services.screenshots.is_available().await;

        if want_screenshots {
            let media: Option<MediaInfo> = metadata_section(entry, "media");
            let duration = media.as_ref().and_then(|m| m.duration_secs).unwrap_or(0.0);
            let shots_dir = self
                .services
                .renamer
                .output_dir()
                .join("screenshots")
                .join(entry.id.to_string());

            match self
                .services
                .screenshots
                .capture(
                    Path::new(&entry.file_path),
                    &shots_dir,
                    self.services.screenshot_count,
                    duration,
                )
                .await
            {
                Ok(paths) => {
                    let host = self.services.image_host.as_ref().expect("checked above");
                    for path in paths {
                        if cancel.is_cancelled() {
                            return Err(PipelineError::Cancelled);
                        }
                        let bytes = tokio::fs::read(&path).await.map_err(|e| {
                            PipelineError::Validation(format!("screenshot vanished: {e}"))
                        })?;
                        match host.upload(&bytes, cancel).await {
                            Ok(url) => screenshot_urls.push(url),
                            Err(e) if e.is_retryable() => return Err(e),
                            Err(e) => {
                                warn!(entry_id = entry.id, error = %e, "Screenshot upload rejected, continuing without it");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(entry_id = entry.id, error = %e, "Screenshot capture failed, continuing without screenshots");
                }
            }
        } else {
            debug!(entry_id = entry.id, "Screenshots skipped");
        }

        let artifacts = StageArtifacts {
            screenshot_urls: Some(screenshot_urls),
            ..Default::default()
        };
        self.commit(entry, Stage::Prepare, artifacts).await
    }

    // ------------------------------------------------------------------
    // Rename
    // ------------------------------------------------------------------

    /// Compose the release name and move the file into the output
    /// directory. Detecting the file already at the target makes the
    /// move idempotent across crashes.
    async fn rename_stage(&self, entry: &FileEntry) -> Result<StageOutcome, PipelineError> {
        let parsed: ParsedRelease = metadata_section(entry, "parsed").unwrap_or_default();
        let media: Option<MediaInfo> = metadata_section(entry, "media");
        let tmdb: Option<MovieMetadata> = metadata_section(entry, "tmdb");

        let release_name = self.services.renamer.compose_release_name(
            &parsed,
            media.as_ref(),
            tmdb.as_ref(),
        );

        let new_path = self
            .services
            .renamer
            .move_into_output(Path::new(&entry.file_path), &release_name)
            .await?;

        let artifacts = StageArtifacts {
            release_name: Some(release_name),
            file_path: Some(new_path.to_string_lossy().to_string()),
            ..Default::default()
        };
        self.commit(entry, Stage::Rename, artifacts).await
    }

    // ------------------------------------------------------------------
    // Generate
    // ------------------------------------------------------------------

    /// Create one torrent per enabled tracker plus the NFO. Re-running
    /// overwrites with identical content.
    async fn generate_stage(&self, entry: &FileEntry) -> Result<StageOutcome, PipelineError> {
        if self.services.adapters.is_empty() {
            return Err(PipelineError::Validation(
                "no enabled trackers configured".into(),
            ));
        }

        let release_name = entry.release_name.clone().ok_or_else(|| {
            PipelineError::Invariant("release name missing after rename".into())
        })?;
        let media_path = PathBuf::from(&entry.file_path);

        let mut torrent_paths = entry.torrent_paths();
        for adapter in &self.services.adapters {
            let announce = adapter.announce_url().ok_or_else(|| {
                PipelineError::Validation(format!(
                    "tracker {} has no announce URL",
                    adapter.slug()
                ))
            })?;
            let tracker_release_name = adapter.release_name_for(&release_name);

            let built = self
                .services
                .torrent_builder
                .build(
                    &media_path,
                    &announce,
                    adapter.schema().source_flag(),
                    &tracker_release_name,
                    adapter.name(),
                    adapter.schema().piece_size_strategy,
                )
                .await
                .map_err(|e| PipelineError::Validation(format!("torrent generation failed: {e}")))?;

            torrent_paths.insert(
                adapter.slug().to_string(),
                built.path.to_string_lossy().to_string(),
            );
        }

        let media: Option<MediaInfo> = metadata_section(entry, "media");
        let tmdb: Option<MovieMetadata> = metadata_section(entry, "tmdb");
        let screenshot_urls = entry.screenshot_urls();
        let nfo_text = self.services.renderer.render_nfo(&PresentationContext {
            release_name: &release_name,
            metadata: tmdb.as_ref(),
            media: media.as_ref(),
            screenshot_urls: &screenshot_urls,
        });

        let nfo_path = self
            .services
            .renamer
            .output_dir()
            .join(format!("{release_name}.nfo"));
        tokio::fs::write(&nfo_path, nfo_text.as_bytes())
            .await
            .map_err(|e| PipelineError::Validation(format!("failed to write NFO: {e}")))?;

        let artifacts = StageArtifacts {
            torrent_paths: Some(torrent_paths),
            nfo_path: Some(nfo_path.to_string_lossy().to_string()),
            ..Default::default()
        };
        self.commit(entry, Stage::Generate, artifacts).await
    }

    // ------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------

    /// Duplicate-check and upload to every enabled tracker, then inject
    /// accepted torrents into the seed client. Trackers that already
    /// have a recorded success or skip are not retried on resume.
    async fn upload_stage(
        &self,
        entry: &FileEntry,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome, PipelineError> {
        let release_name = entry.release_name.clone().ok_or_else(|| {
            PipelineError::Invariant("release name missing before upload".into())
        })?;
        let torrent_paths = entry.torrent_paths();
        let media: Option<MediaInfo> = metadata_section(entry, "media");
        let tmdb: Option<MovieMetadata> = metadata_section(entry, "tmdb");
        let screenshot_urls = entry.screenshot_urls();

        let prior: HashMap<String, TrackerResult> = self
            .services
            .entries
            .tracker_results(entry.id)
            .await
            .map_err(db_error)?
            .into_iter()
            .map(|r| (r.tracker_slug.clone(), r))
            .collect();

        let mut permanent_failures = 0usize;
        let mut successes = 0usize;

        for adapter in &self.services.adapters {
            let slug = adapter.slug().to_string();

            if let Some(previous) = prior.get(&slug) {
                match previous.outcome {
                    TrackerOutcome::Uploaded | TrackerOutcome::SkippedDuplicate => {
                        successes += 1;
                        debug!(entry_id = entry.id, tracker = %slug, "Tracker already done, skipping");
                        continue;
                    }
                    TrackerOutcome::Failed => {}
                }
            }

            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            // A terminal auth failure condemns only this tracker; other
            // trackers may still accept the release
            if let Err(e) = adapter.authenticate(cancel).await {
                if e.is_retryable() || matches!(e, PipelineError::Cancelled) {
                    return Err(e);
                }
                permanent_failures += 1;
                self.services
                    .entries
                    .record_tracker_result(
                        entry.id,
                        &TrackerResult {
                            tracker_slug: slug.clone(),
                            outcome: TrackerOutcome::Failed,
                            remote_torrent_id: None,
                            remote_url: None,
                            error: Some(e.to_string()),
                        },
                    )
                    .await
                    .map_err(db_error)?;
                continue;
            }

            // Duplicate check; a terminal check failure falls through to
            // upload rather than blocking the release
            let duplicate_query = DuplicateQuery {
                tmdb_id: tmdb.as_ref().map(|t| t.tmdb_id),
                imdb_id: tmdb.as_ref().and_then(|t| t.imdb_id.clone()),
                release_name: Some(release_name.clone()),
                quality: media.as_ref().and_then(|m| m.resolution.clone()),
                file_size: media.as_ref().map(|m| m.size_bytes),
            };
            let mut duplicate = match adapter.duplicate_check(&duplicate_query).await {
                Ok(result) => result,
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(tracker = %slug, error = %e, "Duplicate check failed, proceeding to upload");
                    continue_duplicate_default()
                }
            };

            // Second opinion through Prowlarr when the schema names an
            // indexer there and the direct search came back clean
            if !duplicate.is_duplicate {
                if let (Some(prowlarr), Some(hints)) =
                    (&self.services.prowlarr, &adapter.schema().prowlarr)
                {
                    if let Some(indexer) = hints.definition_names.first() {
                        let title = tmdb
                            .as_ref()
                            .map(|t| t.title.clone())
                            .unwrap_or_else(|| release_name.clone());
                        match prowlarr.search_movie(&title, Some(indexer)).await {
                            Ok(items) if !items.is_empty() => {
                                let wanted_tmdb = tmdb.as_ref().map(|t| t.tmdb_id);
                                let confirmed = items.iter().any(|item| {
                                    item.tmdb_id.is_some() && item.tmdb_id == wanted_tmdb
                                });
                                if confirmed {
                                    duplicate.is_duplicate = true;
                                    duplicate.message =
                                        format!("{} release(s) found via Prowlarr", items.len());
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(tracker = %slug, error = %e, "Prowlarr cross-check failed")
                            }
                        }
                    }
                }
            }

            if duplicate.is_duplicate && adapter.skip_on_duplicate() {
                info!(
                    entry_id = entry.id,
                    tracker = %slug,
                    matches = duplicate.matches.len(),
                    "Duplicate found, skipping upload"
                );
                self.services.events.emit(PipelineEvent::DuplicateDetected {
                    entry_id: entry.id,
                    tracker_slug: slug.clone(),
                    matches: duplicate.matches.len(),
                });
                self.services
                    .entries
                    .record_tracker_result(
                        entry.id,
                        &TrackerResult {
                            tracker_slug: slug.clone(),
                            outcome: TrackerOutcome::SkippedDuplicate,
                            remote_torrent_id: duplicate
                                .matches
                                .first()
                                .and_then(|m| m.torrent_id.clone()),
                            remote_url: duplicate.matches.first().and_then(|m| m.url.clone()),
                            error: None,
                        },
                    )
                    .await
                    .map_err(db_error)?;
                successes += 1;
                continue;
            }

            let torrent_path = torrent_paths.get(&slug).ok_or_else(|| {
                PipelineError::Invariant(format!("no torrent generated for tracker {slug}"))
            })?;
            let torrent_bytes = tokio::fs::read(torrent_path).await.map_err(|e| {
                PipelineError::Validation(format!(
                    "torrent file '{torrent_path}' unreadable: {e}"
                ))
            })?;
            let nfo_bytes = match &entry.nfo_path {
                Some(path) => tokio::fs::read(path).await.unwrap_or_default(),
                None => Vec::new(),
            };

            let ctx = self.build_upload_context(
                adapter,
                entry,
                &release_name,
                media.as_ref(),
                tmdb.as_ref(),
                &screenshot_urls,
                torrent_bytes.clone(),
                nfo_bytes,
            );

            match adapter.upload(&ctx, cancel).await {
                Ok(outcome) if outcome.success => {
                    self.services
                        .entries
                        .record_tracker_result(
                            entry.id,
                            &TrackerResult {
                                tracker_slug: slug.clone(),
                                outcome: TrackerOutcome::Uploaded,
                                remote_torrent_id: outcome.torrent_id.clone(),
                                remote_url: outcome.torrent_url.clone(),
                                error: None,
                            },
                        )
                        .await
                        .map_err(db_error)?;
                    successes += 1;

                    if let Some(seed_client) = &self.services.seed_client {
                        let save_path = Path::new(&entry.file_path)
                            .parent()
                            .map(|p| p.to_string_lossy().to_string())
                            .unwrap_or_default();
                        if let Err(e) = seed_client
                            .add_torrent(
                                torrent_bytes,
                                &save_path,
                                self.services.seed_category.as_deref(),
                            )
                            .await
                        {
                            warn!(tracker = %slug, error = %e, "Seed client injection failed");
                        }
                    }
                }
                Ok(outcome) => {
                    permanent_failures += 1;
                    self.services
                        .entries
                        .record_tracker_result(
                            entry.id,
                            &TrackerResult {
                                tracker_slug: slug.clone(),
                                outcome: TrackerOutcome::Failed,
                                remote_torrent_id: None,
                                remote_url: None,
                                error: Some(outcome.message),
                            },
                        )
                        .await
                        .map_err(db_error)?;
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    permanent_failures += 1;
                    self.services
                        .entries
                        .record_tracker_result(
                            entry.id,
                            &TrackerResult {
                                tracker_slug: slug.clone(),
                                outcome: TrackerOutcome::Failed,
                                remote_torrent_id: None,
                                remote_url: None,
                                error: Some(e.to_string()),
                            },
                        )
                        .await
                        .map_err(db_error)?;
                }
            }
        }

        if successes == 0 {
            return Err(PipelineError::Permanent {
                status: 0,
                message: "every tracker failed or was skipped without success".into(),
            });
        }
        if permanent_failures > 0 && self.services.require_all_trackers {
            return Err(PipelineError::Permanent {
                status: 0,
                message: format!("{permanent_failures} tracker(s) failed permanently"),
            });
        }

        self.commit(entry, Stage::Upload, StageArtifacts::default())
            .await
    }

    #[allow(clippy::too_many_arguments)]
    fn build_upload_context(
        &self,
        adapter: &TrackerAdapter,
        entry: &FileEntry,
        release_name: &str,
        media: Option<&MediaInfo>,
        tmdb: Option<&MovieMetadata>,
        screenshot_urls: &[String],
        torrent_bytes: Vec<u8>,
        nfo_bytes: Vec<u8>,
    ) -> UploadContext {
        let tracker_release_name = adapter.release_name_for(release_name);
        let resolution = media.and_then(|m| m.resolution.clone());

        let options = adapter.build_options(&OptionInputs {
            resolution: resolution.as_deref(),
            source: metadata_section::<ParsedRelease>(entry, "parsed")
                .and_then(|p| p.source)
                .as_deref(),
            languages: media.map(|m| m.audio_languages()).unwrap_or_default(),
            genres: tmdb.map(|t| t.genres.as_slice()).unwrap_or(&[]),
            season: None,
            episode: None,
            release_name: Some(release_name),
        });

        let description = self
            .services
            .renderer
            .render_description(&PresentationContext {
                release_name: &tracker_release_name,
                metadata: tmdb,
                media,
                screenshot_urls,
            });

        let values = json!({
            "release_name": tracker_release_name,
            "category_id": adapter.category_id(resolution.as_deref()),
            "options": options,
            "tag_ids": options_as_tags(&options),
            "tmdb_id": tmdb.map(|t| t.tmdb_id),
            "imdb_id": tmdb.and_then(|t| t.imdb_id.clone()),
            "description": description,
            "metadata": tmdb.map(|t| json!(t)).unwrap_or(Value::Null),
            "media": media.map(|m| json!(m)).unwrap_or(Value::Null),
            "screenshots": screenshot_urls,
            "anonymous": false,
        });

        UploadContext::new(values)
            .with_file(
                "torrent_data",
                FilePayload {
                    filename: format!("{tracker_release_name}.torrent"),
                    bytes: torrent_bytes,
                    content_type: "application/x-bittorrent".into(),
                },
            )
            .with_file(
                "nfo_data",
                FilePayload {
                    filename: format!("{tracker_release_name}.nfo"),
                    bytes: nfo_bytes,
                    content_type: "application/octet-stream".into(),
                },
            )
    }
}

/// Flatten multi-select option values into a flat id list for schemas
/// that post tags as one repeated field.
fn options_as_tags(options: &HashMap<String, crate::tracker::options::OptionValue>) -> Vec<i64> {
    use crate::tracker::options::OptionValue;
    let mut tags = Vec::new();
    for value in options.values() {
        match value {
            OptionValue::Many(ids) => tags.extend(ids.iter().copied()),
            OptionValue::One(_) => {}
        }
    }
    tags.sort_unstable();
    tags
}

fn continue_duplicate_default() -> crate::tracker::adapter::DuplicateCheckResult {
    crate::tracker::adapter::DuplicateCheckResult {
        is_duplicate: false,
        method: None,
        matches: Vec::new(),
        exact_matches: Vec::new(),
        message: "duplicate check unavailable".into(),
    }
}

/// Pull one typed section out of the entry's metadata blob.
fn metadata_section<T: serde::de::DeserializeOwned>(entry: &FileEntry, key: &str) -> Option<T> {
    entry
        .metadata_json()
        .and_then(|m| m.get(key).cloned())
        .and_then(|v| serde_json::from_value(v).ok())
}

fn merge_metadata(entry: &FileEntry, key: &str, value: Value) -> Value {
    let base = entry.metadata_json().unwrap_or_else(|| json!({}));
    merge_value(base, key, value)
}

fn merge_value(mut base: Value, key: &str, value: Value) -> Value {
    if let Value::Object(map) = &mut base {
        map.insert(key.to_string(), value);
        base
    } else {
        json!({ key: value })
    }
}

fn db_error(e: anyhow::Error) -> PipelineError {
    PipelineError::Invariant(format!("database error: {e}"))
}
