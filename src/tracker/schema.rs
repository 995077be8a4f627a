//! Declarative tracker schema
//!
//! A tracker is described entirely by a YAML document; the adapter
//! interprets it and never carries tracker-specific branches. The schema
//! is parsed and validated once at load time.
//!
//! # Schema outline
//!
//! ```yaml
//! tracker:
//!   name: Demo Tracker
//!   slug: demo
//!   base_url: https://demo.example
//! auth:
//!   type: bearer           # bearer | api_key | passkey | cookie | none
//!   header: Authorization
//!   prefix: "Bearer "
//! cloudflare:
//!   enabled: false
//!   service: flaresolverr
//! endpoints:
//!   search: /api/torrents/search
//!   upload: { path: /api/torrents/upload, method: POST }
//!   categories: /api/categories
//! rate_limiting:
//!   upload: { capacity: 1, refill_rate: 0.5 }
//! upload:
//!   fields:
//!     - { name: torrent, type: file, source: torrent_data, required: true }
//!     - { name: name, type: string, source: release_name, required: true }
//!     - { name: tag_ids, type: repeated, source: options.tags }
//!     - { name: anonymous, type: boolean, source: anonymous, default: false }
//! options:
//!   language:
//!     type: "1"
//!     multi_select: true
//!     auto_multi: true
//!     auto_multi_value: 4
//!     mappings: { english: 1, french: 2, multi: 4 }
//! categories:
//!   movie_1080p: "9"
//!   movie: "1"
//! piece_size_strategy: standard   # auto | standard | coarse
//! search:
//!   default_query: ""
//!   params: { tmdb_id: tmdbId, imdb_id: imdb, query: q }
//!   response: { format: json, path: data }
//! response:
//!   upload:
//!     success_field: success
//!     error_field: error
//!     torrent_id_field: data.id
//!     torrent_url_template: "{tracker_url}/torrent/{torrent_id}"
//! validation:
//!   release_name: { required: true, min_length: 8 }
//! sanitize:
//!   operations:
//!     - { type: replace_spaces, replacement: "." }
//!     - { type: collapse_dots }
//! ```

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::sanitize::SanitizeOp;
use crate::services::rate_limiter::RateLimitConfig;
use crate::services::torrent_builder::PieceSizeStrategy;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackerSchema {
    pub tracker: TrackerIdentity,
    #[serde(default)]
    pub auth: AuthBlock,
    #[serde(default)]
    pub cloudflare: CloudflareBlock,
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointDef>,
    #[serde(default)]
    pub rate_limiting: HashMap<String, RateLimitConfig>,
    #[serde(default)]
    pub upload: UploadBlock,
    #[serde(default)]
    pub options: HashMap<String, OptionSpec>,
    #[serde(default)]
    pub categories: HashMap<String, String>,
    #[serde(default)]
    pub search: SearchBlock,
    #[serde(default)]
    pub response: ResponseBlock,
    #[serde(default)]
    pub validation: HashMap<String, FieldRules>,
    #[serde(default)]
    pub sanitize: SanitizeBlock,
    #[serde(default)]
    pub prowlarr: Option<ProwlarrHints>,
    /// Source flag embedded in generated torrents; defaults to the slug
    pub source_flag: Option<String>,
    /// How piece sizes are chosen for this tracker's torrents
    #[serde(default)]
    pub piece_size_strategy: PieceSizeStrategy,
    /// Per-tracker release-name override; `{release_name}` interpolated
    pub naming_template: Option<String>,
    /// Skip upload when the duplicate check matches (default true)
    #[serde(default = "default_true")]
    pub skip_on_duplicate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackerIdentity {
    pub name: String,
    pub slug: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Bearer,
    ApiKey,
    Passkey,
    Cookie,
    #[default]
    None,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AuthBlock {
    #[serde(rename = "type", default)]
    pub auth_type: AuthType,
    /// Header carrying the credential (bearer/api_key)
    pub header: Option<String>,
    /// Value prefix, e.g. "Bearer "
    pub prefix: Option<String>,
    /// Query parameter name for trackers wanting the key in the URL
    pub query_param: Option<String>,
    /// Parameter name for passkey auth
    pub passkey_param: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CloudflareBlock {
    #[serde(default)]
    pub enabled: bool,
    /// Only "flaresolverr" is recognized
    pub service: Option<String>,
}

/// Endpoint as either a bare path or a path+method mapping.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EndpointDef {
    Path(String),
    Full { path: String, method: Option<String> },
}

impl EndpointDef {
    pub fn path(&self) -> &str {
        match self {
            EndpointDef::Path(p) => p,
            EndpointDef::Full { path, .. } => path,
        }
    }

    pub fn method(&self) -> &str {
        match self {
            EndpointDef::Path(_) => "GET",
            EndpointDef::Full { method, .. } => method.as_deref().unwrap_or("GET"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct UploadBlock {
    #[serde(default)]
    pub fields: Vec<UploadField>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    File,
    String,
    Json,
    Boolean,
    Repeated,
    Number,
}

/// One upload form field, resolved by dotted path from the build context.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub source: String,
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
    /// Filename template for file fields; `{release_name}` interpolated
    pub filename: Option<String>,
}

/// One semantic facet (language, quality, genre, season, episode, ...)
/// mapped to a tracker option type.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct OptionSpec {
    /// API option type id this facet posts under
    #[serde(rename = "type")]
    pub type_id: Option<String>,
    #[serde(default)]
    pub multi_select: bool,
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub mappings: HashMap<String, i64>,
    /// TMDB genre id -> tracker option id
    #[serde(default)]
    pub tmdb_mappings: HashMap<i64, i64>,
    /// Normalized name -> tracker option id
    #[serde(default)]
    pub name_mappings: HashMap<String, i64>,
    /// Quality fallback keyed by bare resolution
    #[serde(default)]
    pub resolution_fallback: HashMap<String, i64>,
    /// Add `auto_multi_value` when both french and english audio present
    #[serde(default)]
    pub auto_multi: bool,
    pub auto_multi_value: Option<i64>,
    // Season/episode arithmetic
    pub complete_value: Option<i64>,
    pub base_value: Option<i64>,
    pub max_value: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SearchBlock {
    #[serde(default)]
    pub default_query: String,
    #[serde(default)]
    pub params: SearchParams,
    #[serde(default)]
    pub response: SearchResponse,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchParams {
    #[serde(default = "default_tmdb_param")]
    pub tmdb_id: String,
    #[serde(default = "default_imdb_param")]
    pub imdb_id: String,
    #[serde(default = "default_query_param")]
    pub query: String,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            tmdb_id: default_tmdb_param(),
            imdb_id: default_imdb_param(),
            query: default_query_param(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchFormat {
    #[default]
    Json,
    TorznabXml,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SearchResponse {
    #[serde(default)]
    pub format: SearchFormat,
    /// Dotted path of the torrent list in a JSON response
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ResponseBlock {
    #[serde(default)]
    pub upload: UploadResponse,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadResponse {
    #[serde(default = "default_success_field")]
    pub success_field: String,
    #[serde(default = "default_error_field")]
    pub error_field: String,
    #[serde(default = "default_torrent_id_field")]
    pub torrent_id_field: String,
    #[serde(default = "default_torrent_url_template")]
    pub torrent_url_template: String,
}

impl Default for UploadResponse {
    fn default() -> Self {
        Self {
            success_field: default_success_field(),
            error_field: default_error_field(),
            torrent_id_field: default_torrent_id_field(),
            torrent_url_template: default_torrent_url_template(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct FieldRules {
    #[serde(default)]
    pub required: bool,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SanitizeBlock {
    #[serde(default)]
    pub operations: Vec<SanitizeOp>,
}

/// Hints matching this tracker to a Prowlarr indexer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProwlarrHints {
    #[serde(default)]
    pub url_patterns: Vec<String>,
    #[serde(default)]
    pub definition_names: Vec<String>,
}

impl TrackerSchema {
    /// Source flag for torrent generation; slug when unset.
    pub fn source_flag(&self) -> &str {
        self.source_flag
            .as_deref()
            .unwrap_or(&self.tracker.slug)
    }

    pub fn endpoint(&self, key: &str) -> Option<&EndpointDef> {
        self.endpoints.get(key)
    }

    /// Absolute URL for an endpoint key.
    pub fn endpoint_url(&self, key: &str) -> Option<String> {
        self.endpoint(key).map(|e| {
            let base = self.tracker.base_url.trim_end_matches('/');
            let path = e.path();
            if path.starts_with("http://") || path.starts_with("https://") {
                path.to_string()
            } else {
                format!("{}/{}", base, path.trim_start_matches('/'))
            }
        })
    }
}

/// Parse and validate a schema document.
pub fn load_schema(yaml: &str) -> Result<TrackerSchema> {
    let schema: TrackerSchema =
        serde_yaml::from_str(yaml).context("failed to parse tracker schema")?;

    if schema.tracker.slug.trim().is_empty() {
        bail!("tracker schema missing slug");
    }
    if schema.tracker.base_url.trim().is_empty() {
        bail!("tracker schema missing base_url");
    }
    if schema.cloudflare.enabled {
        match schema.cloudflare.service.as_deref() {
            Some("flaresolverr") | None => {}
            Some(other) => bail!("unknown cloudflare service '{other}'"),
        }
    }

    let mut seen = std::collections::HashSet::new();
    for field in &schema.upload.fields {
        if !seen.insert(field.name.as_str()) {
            bail!("duplicate upload field '{}'", field.name);
        }
        if field.source.trim().is_empty() {
            bail!("upload field '{}' has an empty source", field.name);
        }
    }

    for (field, rules) in &schema.validation {
        if let Some(pattern) = &rules.pattern {
            Regex::new(pattern)
                .with_context(|| format!("invalid validation pattern for '{field}'"))?;
        }
    }

    Ok(schema)
}

/// Export a schema back to YAML. Round-trips load/export to the same
/// semantic document (map ordering aside).
pub fn export_schema(schema: &TrackerSchema) -> Result<String> {
    serde_yaml::to_string(schema).context("failed to serialize tracker schema")
}

fn default_true() -> bool {
    true
}
fn default_tmdb_param() -> String {
    "tmdbId".to_string()
}
fn default_imdb_param() -> String {
    "imdb".to_string()
}
fn default_query_param() -> String {
    "q".to_string()
}
fn default_success_field() -> String {
    "success".to_string()
}
fn default_error_field() -> String {
    "error".to_string()
}
fn default_torrent_id_field() -> String {
    "data.id".to_string()
}
fn default_torrent_url_template() -> String {
    "{tracker_url}/torrent/{torrent_id}".to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const DEMO_SCHEMA: &str = r#"
tracker:
  name: Demo Tracker
  slug: demo
  base_url: https://demo.example
auth:
  type: bearer
  header: Authorization
  prefix: "Bearer "
endpoints:
  search: /api/torrents/search
  upload: { path: /api/torrents/upload, method: POST }
  categories: /api/categories
rate_limiting:
  upload: { capacity: 1, refill_rate: 0.5 }
upload:
  fields:
    - { name: torrent, type: file, source: torrent_data, required: true }
    - { name: name, type: string, source: release_name, required: true }
    - { name: tag_ids, type: repeated, source: tag_ids }
    - { name: anonymous, type: boolean, source: anonymous, default: false }
options:
  language:
    type: "1"
    multi_select: true
    auto_multi: true
    auto_multi_value: 4
    mappings: { english: 1, french: 2, multi: 4 }
categories:
  movie_1080p: "9"
  movie: "1"
piece_size_strategy: standard
search:
  params: { tmdb_id: tmdbId, imdb_id: imdb, query: q }
  response: { format: json, path: data }
validation:
  release_name: { required: true, min_length: 8 }
sanitize:
  operations:
    - { type: replace_spaces, replacement: "." }
    - { type: collapse_dots }
"#;

    #[test]
    fn test_load_demo_schema() {
        let schema = load_schema(DEMO_SCHEMA).unwrap();
        assert_eq!(schema.tracker.slug, "demo");
        assert_eq!(schema.auth.auth_type, AuthType::Bearer);
        assert_eq!(schema.upload.fields.len(), 4);
        assert_eq!(schema.upload.fields[2].field_type, FieldType::Repeated);
        assert_eq!(schema.source_flag(), "demo");
        assert_eq!(schema.piece_size_strategy, PieceSizeStrategy::Standard);
        assert!(schema.skip_on_duplicate);
        assert_eq!(
            schema.endpoint_url("upload").as_deref(),
            Some("https://demo.example/api/torrents/upload")
        );
        assert_eq!(schema.endpoint("upload").unwrap().method(), "POST");
        assert_eq!(schema.endpoint("search").unwrap().method(), "GET");
    }

    #[test]
    fn test_piece_size_strategy_defaults_to_auto() {
        let yaml = r#"
tracker: { name: X, slug: x, base_url: "https://x" }
"#;
        let schema = load_schema(yaml).unwrap();
        assert_eq!(schema.piece_size_strategy, PieceSizeStrategy::Auto);
    }

    #[test]
    fn test_rate_limit_override_parsed() {
        let schema = load_schema(DEMO_SCHEMA).unwrap();
        let upload = schema.rate_limiting.get("upload").unwrap();
        assert_eq!(upload.capacity, 1);
        assert!((upload.refill_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let yaml = r#"
tracker: { name: X, slug: x, base_url: "https://x" }
upload:
  fields:
    - { name: a, type: string, source: s1 }
    - { name: a, type: string, source: s2 }
"#;
        assert!(load_schema(yaml).is_err());
    }

    #[test]
    fn test_invalid_validation_pattern_rejected() {
        let yaml = r#"
tracker: { name: X, slug: x, base_url: "https://x" }
validation:
  release_name: { pattern: "[unclosed" }
"#;
        assert!(load_schema(yaml).is_err());
    }

    #[test]
    fn test_import_export_round_trip() {
        let schema = load_schema(DEMO_SCHEMA).unwrap();
        let exported = export_schema(&schema).unwrap();
        let reloaded = load_schema(&exported).unwrap();
        assert_eq!(schema.tracker.slug, reloaded.tracker.slug);
        assert_eq!(schema.upload.fields.len(), reloaded.upload.fields.len());
        assert_eq!(
            schema.categories.get("movie_1080p"),
            reloaded.categories.get("movie_1080p")
        );
        assert_eq!(
            schema.options.get("language").unwrap().auto_multi_value,
            reloaded.options.get("language").unwrap().auto_multi_value
        );
    }
}
