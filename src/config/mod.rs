//! Pipeline configuration
//!
//! The embedding program (web UI, CLI, service wrapper) owns argument and
//! environment parsing; it hands the core a fully-populated `Config`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::services::rate_limiter::RateLimitConfig;

/// Whether the Approve stage needs a human or advances on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Approve immediately after analysis
    #[default]
    Auto,
    /// Stop at ANALYZED until an operator approves the entry
    Manual,
}

/// Credentials and schema for one tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerEntry {
    /// Declarative tracker schema, YAML
    pub schema_yaml: String,
    pub api_key: Option<String>,
    pub passkey: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// qBittorrent connection settings for post-upload seeding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedClientConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Category assigned to injected torrents
    pub category: Option<String>,
}

/// Image host used for screenshot uploads during Prepare.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageHostConfig {
    pub upload_url: String,
    pub api_key: String,
}

/// Prowlarr connection for cross-indexer search hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProwlarrConfig {
    pub base_url: String,
    pub api_key: String,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL (e.g. `sqlite://./data/seedforge.db`)
    pub database_url: String,

    /// Root directory media files are submitted from
    pub input_media_path: PathBuf,

    /// Directory renamed media, torrents and NFOs are written under
    pub output_dir: PathBuf,

    /// Distinct files processed concurrently; per-file execution is serial
    pub worker_concurrency: usize,

    /// Queue poll interval when idle
    pub poll_interval: Duration,

    /// RUNNING jobs older than this are treated as crashed on startup
    pub stale_running_grace: Duration,

    /// Retry attempts per queue job
    pub max_attempts: u32,

    /// FlareSolverr endpoint for Cloudflare-protected trackers
    pub flaresolverr_url: Option<String>,
    pub flaresolverr_timeout_ms: u64,

    pub tmdb_api_key: Option<String>,
    pub tmdb_cache_ttl_days: i64,

    pub seed_client: Option<SeedClientConfig>,
    pub image_host: Option<ImageHostConfig>,
    pub prowlarr: Option<ProwlarrConfig>,

    /// Per-key overrides, keyed `"service/action"`
    pub rate_limits: HashMap<String, RateLimitConfig>,

    pub trackers: Vec<TrackerEntry>,

    pub approval_policy: ApprovalPolicy,

    /// When true, a single permanently-failed tracker fails the entry
    /// even if other trackers succeeded
    pub require_all_trackers: bool,

    /// Screenshots captured per file during Prepare (0 disables)
    pub screenshot_count: u32,
}

impl Config {
    pub fn new(
        database_url: impl Into<String>,
        input_media_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            database_url: database_url.into(),
            input_media_path: input_media_path.into(),
            output_dir: output_dir.into(),
            worker_concurrency: 1,
            poll_interval: Duration::from_secs(5),
            stale_running_grace: Duration::from_secs(300),
            max_attempts: 3,
            flaresolverr_url: None,
            flaresolverr_timeout_ms: 60_000,
            tmdb_api_key: None,
            tmdb_cache_ttl_days: 30,
            seed_client: None,
            image_host: None,
            prowlarr: None,
            rate_limits: HashMap::new(),
            trackers: Vec::new(),
            approval_policy: ApprovalPolicy::default(),
            require_all_trackers: true,
            screenshot_count: 4,
        }
    }
}

fn default_true() -> bool {
    true
}
