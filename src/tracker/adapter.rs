//! Config-driven tracker adapter
//!
//! One adapter serves every tracker: authentication, search, duplicate
//! checking and upload are all interpreted from the declarative schema.
//! Adding a tracker means writing YAML, not code.
//!
//! Upload field resolution walks the schema's ordered field list and
//! pulls values out of a build context by dotted path. Fields declared
//! `repeated` become multiple form parts under the same key; at least
//! one supported tracker rejects JSON-array encoding, so that detail is
//! contract-bearing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::options::{OptionInputs, OptionValue, OptionsMapper};
use super::sanitize::sanitize_name;
use super::schema::{AuthType, FieldType, SearchFormat, TrackerSchema, UploadField};
use super::torznab;
use crate::error::PipelineError;
use crate::services::circuit_breaker::CircuitState;
use crate::services::flaresolverr::{CloudflareSession, FlareSolverrClient};
use crate::services::rate_limiter::{retry_with_backoff, RetryConfig};
use crate::services::registry::ServiceRegistry;

/// A file attached to an upload.
#[derive(Debug, Clone)]
pub struct FilePayload {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Build context for field resolution: a JSON object looked up by dotted
/// path, plus binary payloads keyed by source name.
#[derive(Debug, Default)]
pub struct UploadContext {
    pub values: Value,
    pub files: HashMap<String, FilePayload>,
}

impl UploadContext {
    pub fn new(values: Value) -> Self {
        Self {
            values,
            files: HashMap::new(),
        }
    }

    pub fn with_file(mut self, source: impl Into<String>, payload: FilePayload) -> Self {
        self.files.insert(source.into(), payload);
        self
    }

    /// Dotted-path lookup (`metadata.title`, `options.1`); numeric
    /// segments index into arrays.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.values, path)
    }
}

fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// A form part ready for transmission. Kept as data so field assembly is
/// testable without a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormPart {
    Text { name: String, value: String },
    File { name: String, source: String, filename: String },
}

/// One release found on a tracker.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub title: String,
    pub tmdb_id: Option<i64>,
    pub imdb_id: Option<String>,
    pub size: i64,
    pub seeders: i32,
    pub leechers: i32,
    pub url: Option<String>,
    pub torrent_id: Option<String>,
}

/// How a duplicate was found; ranked tmdb > imdb > name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    Tmdb,
    Imdb,
    Name,
}

#[derive(Debug, Clone)]
pub struct DuplicateQuery {
    pub tmdb_id: Option<i64>,
    pub imdb_id: Option<String>,
    pub release_name: Option<String>,
    /// Quality substring filter (e.g. "1080p")
    pub quality: Option<String>,
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateCheckResult {
    pub is_duplicate: bool,
    pub method: Option<SearchMethod>,
    pub matches: Vec<SearchHit>,
    /// Matches within 1% of the submitted file size
    pub exact_matches: Vec<SearchHit>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub success: bool,
    pub torrent_id: Option<String>,
    pub torrent_url: Option<String>,
    pub message: String,
    pub response: Value,
}

/// Result of a dry-run hook.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerTestReport {
    pub operation: String,
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterHealth {
    pub healthy: bool,
    pub tracker_reachable: bool,
    pub authenticated: bool,
    pub breaker_state: Option<CircuitState>,
}

pub struct TrackerAdapter {
    schema: TrackerSchema,
    api_key: Option<String>,
    passkey: Option<String>,
    client: reqwest::Client,
    registry: Arc<ServiceRegistry>,
    flaresolverr: Option<Arc<FlareSolverrClient>>,
    session: Mutex<Option<CloudflareSession>>,
    retry: RetryConfig,
}

impl TrackerAdapter {
    pub fn new(
        schema: TrackerSchema,
        api_key: Option<String>,
        passkey: Option<String>,
        registry: Arc<ServiceRegistry>,
        flaresolverr: Option<Arc<FlareSolverrClient>>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .gzip(true)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            schema,
            api_key,
            passkey,
            client,
            registry,
            flaresolverr,
            session: Mutex::new(None),
            retry: RetryConfig::default(),
        }
    }

    /// Push the schema's `rate_limiting` overrides into the registry.
    pub async fn register_rate_limits(&self) {
        for (action, config) in &self.schema.rate_limiting {
            self.registry
                .rate_limiter()
                .configure(&self.service_key(), action, *config)
                .await;
        }
    }

    pub fn slug(&self) -> &str {
        &self.schema.tracker.slug
    }

    pub fn name(&self) -> &str {
        &self.schema.tracker.name
    }

    pub fn schema(&self) -> &TrackerSchema {
        &self.schema
    }

    pub fn skip_on_duplicate(&self) -> bool {
        self.schema.skip_on_duplicate
    }

    fn service_key(&self) -> String {
        format!("tracker/{}", self.schema.tracker.slug)
    }

    fn effective_key(&self) -> Option<&str> {
        self.api_key.as_deref().or(self.passkey.as_deref())
    }

    /// Announce URL with the passkey appended, for torrent generation.
    pub fn announce_url(&self) -> Option<String> {
        let base = self.schema.tracker.base_url.trim_end_matches('/');
        self.passkey
            .as_deref()
            .map(|passkey| format!("{base}/announce?passkey={passkey}"))
            .or_else(|| Some(format!("{base}/announce")))
    }

    /// Tracker-specific release name: naming template, then the schema's
    /// sanitize pipeline.
    pub fn release_name_for(&self, release_name: &str) -> String {
        let named = match &self.schema.naming_template {
            Some(template) => template.replace("{release_name}", release_name),
            None => release_name.to_string(),
        };
        sanitize_name(&named, &self.schema.sanitize.operations)
    }

    /// Category id for a movie at the given resolution, most specific
    /// key first.
    pub fn category_id(&self, resolution: Option<&str>) -> Option<String> {
        if let Some(res) = resolution {
            let key = format!("movie_{}", res.to_lowercase());
            if let Some(id) = self.schema.categories.get(&key) {
                return Some(id.clone());
            }
        }
        self.schema
            .categories
            .get("movie")
            .or_else(|| self.schema.categories.get("default"))
            .cloned()
    }

    /// Resolve option facets for this tracker.
    pub fn build_options(&self, inputs: &OptionInputs) -> HashMap<String, OptionValue> {
        OptionsMapper::new(&self.schema.options).build_options(inputs)
    }

    // ------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------

    /// Prepare a session: obtain Cloudflare cookies when configured and
    /// verify credentials are usable.
    pub async fn authenticate(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        if self.schema.cloudflare.enabled {
            let solver = self.flaresolverr.as_ref().ok_or_else(|| {
                PipelineError::Validation(format!(
                    "{} requires a Cloudflare bypass service but none is configured",
                    self.schema.tracker.name
                ))
            })?;
            let session = solver.get_session(&self.schema.tracker.base_url).await?;
            *self.session.lock().await = Some(session);
        }

        match self.schema.auth.auth_type {
            AuthType::Bearer | AuthType::ApiKey => {
                if self.effective_key().is_none() {
                    return Err(PipelineError::AuthRejected(format!(
                        "{} requires an API key",
                        self.schema.tracker.name
                    )));
                }
                // A lightweight endpoint verifies the key when declared;
                // Cloudflare trackers validate on first real call instead
                if !self.schema.cloudflare.enabled {
                    if let Some(url) = self.schema.endpoint_url("authenticate") {
                        self.verify_credentials(&url).await?;
                    }
                }
            }
            AuthType::Passkey => {
                let valid = self.passkey.as_deref().map(|p| p.len() >= 10).unwrap_or(false);
                if !valid {
                    return Err(PipelineError::AuthRejected(format!(
                        "invalid passkey for {}",
                        self.schema.tracker.name
                    )));
                }
            }
            AuthType::Cookie => {
                if self.session.lock().await.is_none() {
                    return Err(PipelineError::AuthRejected(format!(
                        "{} uses cookie auth but no session was established",
                        self.schema.tracker.name
                    )));
                }
            }
            AuthType::None => {}
        }

        info!(tracker = %self.schema.tracker.slug, "Authenticated with tracker");
        Ok(())
    }

    async fn verify_credentials(&self, url: &str) -> Result<(), PipelineError> {
        let request = self
            .apply_auth(self.client.get(url))
            .await;
        let response = request.send().await.map_err(PipelineError::from_reqwest)?;
        let status = response.status().as_u16();
        match status {
            401 | 403 => Err(PipelineError::AuthRejected(format!(
                "credentials rejected with HTTP {status}"
            ))),
            s if s >= 500 => Err(PipelineError::from_status(s, "auth endpoint unavailable")),
            _ => Ok(()),
        }
    }

    async fn apply_auth(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let auth = &self.schema.auth;
        if let Some(key) = self.effective_key() {
            match auth.auth_type {
                AuthType::Bearer => {
                    let header = auth.header.as_deref().unwrap_or("Authorization");
                    let prefix = auth.prefix.as_deref().unwrap_or("Bearer ");
                    request = request.header(header, format!("{prefix}{key}"));
                }
                AuthType::ApiKey => {
                    let header = auth.header.as_deref().unwrap_or("X-API-Key");
                    request = request.header(header, key);
                }
                _ => {}
            }
            if let Some(param) = &auth.query_param {
                request = request.query(&[(param.as_str(), key)]);
            }
        }
        if let (AuthType::Passkey, Some(param), Some(passkey)) = (
            auth.auth_type,
            auth.passkey_param.as_deref(),
            self.passkey.as_deref(),
        ) {
            request = request.query(&[(param, passkey)]);
        }

        if let Some(session) = self.session.lock().await.as_ref() {
            request = request.header(reqwest::header::COOKIE, session.cookie_header());
            if let Some(ua) = &session.user_agent {
                request = request.header(reqwest::header::USER_AGENT, ua.clone());
            }
        }

        request
    }

    // ------------------------------------------------------------------
    // Search and duplicate check
    // ------------------------------------------------------------------

    /// Free-text search using the schema's query parameter.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, PipelineError> {
        let param = self.schema.search.params.query.clone();
        self.search_with_params(vec![(param, query.to_string())])
            .await
    }

    async fn search_with_params(
        &self,
        params: Vec<(String, String)>,
    ) -> Result<Vec<SearchHit>, PipelineError> {
        let url = self.schema.endpoint_url("search").ok_or_else(|| {
            PipelineError::Validation(format!(
                "{} has no search endpoint configured",
                self.schema.tracker.name
            ))
        })?;

        self.registry
            .rate_limiter()
            .acquire(&self.service_key(), "search")
            .await;

        let request = self.apply_auth(self.client.get(&url)).await.query(&params);
        debug!(tracker = %self.slug(), url = %url, "Searching tracker");

        let response = request.send().await.map_err(PipelineError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_response(
                status.as_u16(),
                retry_after,
                body.chars().take(200).collect(),
            ));
        }

        let body = response.text().await.map_err(PipelineError::from_reqwest)?;
        self.parse_search_body(&body)
    }

    fn parse_search_body(&self, body: &str) -> Result<Vec<SearchHit>, PipelineError> {
        let trimmed = body.trim_start();
        let looks_like_xml = trimmed.starts_with("<?xml") || trimmed.starts_with("<rss");

        if self.schema.search.response.format == SearchFormat::TorznabXml || looks_like_xml {
            let items = torznab::parse_torznab(body)
                .map_err(|e| PipelineError::Permanent {
                    status: 0,
                    message: format!("unparseable search response: {e}"),
                })?;
            return Ok(items
                .into_iter()
                .map(|i| SearchHit {
                    title: i.title,
                    tmdb_id: i.tmdb_id,
                    imdb_id: i.imdb_id,
                    size: i.size,
                    seeders: i.seeders,
                    leechers: i.leechers,
                    torrent_id: Some(i.guid),
                    url: i.link,
                })
                .collect());
        }

        let parsed: Value = serde_json::from_str(body).map_err(|e| PipelineError::Permanent {
            status: 0,
            message: format!("unparseable search response: {e}"),
        })?;

        let list = match &self.schema.search.response.path {
            Some(path) => lookup_path(&parsed, path).cloned().unwrap_or(Value::Null),
            None => parsed.clone(),
        };

        let items = match list {
            Value::Array(items) => items,
            Value::Null => match &parsed {
                // Common envelope keys when no path is configured
                Value::Object(map) => map
                    .get("torrents")
                    .or_else(|| map.get("data"))
                    .or_else(|| map.get("results"))
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };

        Ok(items.iter().filter_map(json_search_hit).collect())
    }

    /// Query the tracker for an existing copy of this release.
    ///
    /// TMDB id is the strongest signal, then IMDB id, then a title query
    /// derived from the release name. An optional quality substring
    /// narrows matches; exact matches are detected by size within 1%.
    pub async fn duplicate_check(
        &self,
        query: &DuplicateQuery,
    ) -> Result<DuplicateCheckResult, PipelineError> {
        let params = &self.schema.search.params;
        let default_query = &self.schema.search.default_query;

        let mut matches: Vec<SearchHit> = Vec::new();
        let mut method = None;

        if let Some(tmdb_id) = query.tmdb_id {
            let mut search = vec![(params.tmdb_id.clone(), tmdb_id.to_string())];
            if !default_query.is_empty() {
                search.push((params.query.clone(), default_query.clone()));
            }
            matches = self.search_with_params(search).await?;
            if !matches.is_empty() {
                method = Some(SearchMethod::Tmdb);
            }
        }

        if matches.is_empty() {
            if let Some(imdb_id) = &query.imdb_id {
                matches = self
                    .search_with_params(vec![(params.imdb_id.clone(), imdb_id.clone())])
                    .await?;
                if !matches.is_empty() {
                    method = Some(SearchMethod::Imdb);
                }
            }
        }

        if matches.is_empty() {
            if let Some(release_name) = &query.release_name {
                let title = title_from_release_name(release_name);
                matches = self
                    .search_with_params(vec![(params.query.clone(), title)])
                    .await?;
                if !matches.is_empty() {
                    method = Some(SearchMethod::Name);
                }
            }
        }

        if let Some(quality) = &query.quality {
            let quality_lower = quality.to_lowercase();
            let filtered: Vec<SearchHit> = matches
                .iter()
                .filter(|hit| hit.title.to_lowercase().contains(&quality_lower))
                .cloned()
                .collect();
            if filtered.is_empty() {
                matches.clear();
                method = None;
            } else {
                matches = filtered;
            }
        }

        let exact_matches: Vec<SearchHit> = match query.file_size {
            Some(size) if size > 0 => {
                let tolerance = size / 100;
                matches
                    .iter()
                    .filter(|hit| hit.size > 0 && (hit.size - size).abs() <= tolerance)
                    .cloned()
                    .collect()
            }
            _ => Vec::new(),
        };

        let is_duplicate = !matches.is_empty();
        let message = if !exact_matches.is_empty() {
            format!("{} release(s) with matching size", exact_matches.len())
        } else if is_duplicate {
            format!("{} existing release(s) found", matches.len())
        } else {
            "no duplicates found".to_string()
        };

        debug!(
            tracker = %self.slug(),
            duplicate = is_duplicate,
            method = ?method,
            "Duplicate check complete"
        );

        Ok(DuplicateCheckResult {
            is_duplicate,
            method,
            matches,
            exact_matches,
            message,
        })
    }

    // ------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------

    /// Resolve the schema's upload fields against the context. Missing
    /// required fields fail here, before any network traffic.
    pub fn assemble_form_parts(
        &self,
        ctx: &UploadContext,
    ) -> Result<Vec<FormPart>, PipelineError> {
        assemble_form_parts(&self.schema.upload.fields, ctx)
    }

    /// Check the schema's validation rules against the context.
    pub fn validate_context(&self, ctx: &UploadContext) -> Vec<String> {
        let mut errors = Vec::new();
        for (field, rules) in &self.schema.validation {
            let value = ctx.lookup(field);
            let as_str = value.and_then(|v| v.as_str());

            if rules.required && value.map(|v| v.is_null()).unwrap_or(true) {
                errors.push(format!("missing required field: {field}"));
                continue;
            }
            let Some(text) = as_str else { continue };

            if let Some(min) = rules.min_length {
                if text.len() < min {
                    errors.push(format!("{field} too short: {} < {min}", text.len()));
                }
            }
            if let Some(max) = rules.max_length {
                if text.len() > max {
                    errors.push(format!("{field} too long: {} > {max}", text.len()));
                }
            }
            if let Some(pattern) = &rules.pattern {
                if let Ok(re) = Regex::new(pattern) {
                    if !re.is_match(text) {
                        errors.push(format!("{field} does not match pattern {pattern}"));
                    }
                }
            }
        }
        errors
    }

    /// Upload a release. Rate-limited, retried on transient failures and
    /// (for Cloudflare trackers) breaker-guarded.
    pub async fn upload(
        &self,
        ctx: &UploadContext,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, PipelineError> {
        let validation_errors = self.validate_context(ctx);
        if !validation_errors.is_empty() {
            return Err(PipelineError::Validation(validation_errors.join("; ")));
        }
        let parts = self.assemble_form_parts(ctx)?;

        let url = self.schema.endpoint_url("upload").ok_or_else(|| {
            PipelineError::Validation(format!(
                "{} has no upload endpoint configured",
                self.schema.tracker.name
            ))
        })?;
        let method = self
            .schema
            .endpoint("upload")
            .map(|e| e.method().to_string())
            .filter(|m| m != "GET")
            .unwrap_or_else(|| "POST".to_string());

        let attempt = || async {
            self.registry
                .rate_limiter()
                .acquire(&self.service_key(), "upload")
                .await;

            let form = build_multipart(&parts, &ctx.files)?;
            let method = reqwest::Method::from_bytes(method.as_bytes())
                .unwrap_or(reqwest::Method::POST);
            let request = self
                .apply_auth(self.client.request(method, &url))
                .await
                .timeout(Duration::from_secs(600))
                .multipart(form);

            debug!(tracker = %self.slug(), url = %url, "Uploading release");
            let response = request.send().await.map_err(PipelineError::from_reqwest)?;

            let status = response.status();
            if !status.is_success() {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                let body = response.text().await.unwrap_or_default();
                return Err(PipelineError::from_response(
                    status.as_u16(),
                    retry_after,
                    body.chars().take(300).collect(),
                ));
            }

            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            Ok(self.parse_upload_response(status_code, &body))
        };

        let outcome = if self.schema.cloudflare.enabled {
            let breaker = self
                .registry
                .breaker(&format!("tracker/{}", self.slug()));
            retry_with_backoff("tracker_upload", &self.retry, cancel, || {
                breaker.call(attempt)
            })
            .await?
        } else {
            retry_with_backoff("tracker_upload", &self.retry, cancel, attempt).await?
        };

        if outcome.success {
            info!(
                tracker = %self.slug(),
                torrent_id = ?outcome.torrent_id,
                "Upload accepted"
            );
        } else {
            warn!(
                tracker = %self.slug(),
                message = %outcome.message,
                "Upload rejected by tracker"
            );
        }
        Ok(outcome)
    }

    fn parse_upload_response(&self, status: u16, body: &str) -> UploadOutcome {
        let config = &self.schema.response.upload;

        let parsed: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(_) => {
                // 2xx with a non-JSON body still counts as accepted
                return UploadOutcome {
                    success: true,
                    torrent_id: None,
                    torrent_url: None,
                    message: format!("upload accepted (HTTP {status})"),
                    response: Value::String(body.chars().take(300).collect()),
                };
            }
        };

        let success = match lookup_path(&parsed, &config.success_field) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true" || s == "1" || s == "ok",
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            _ => true,
        };

        let torrent_id = lookup_path(&parsed, &config.torrent_id_field).and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        let torrent_url = torrent_id.as_ref().map(|id| {
            config
                .torrent_url_template
                .replace("{tracker_url}", self.schema.tracker.base_url.trim_end_matches('/'))
                .replace("{torrent_id}", id)
        });

        let message = if success {
            "upload successful".to_string()
        } else {
            lookup_path(&parsed, &config.error_field)
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "upload failed".to_string())
        };

        UploadOutcome {
            success,
            torrent_id,
            torrent_url,
            message,
            response: parsed,
        }
    }

    // ------------------------------------------------------------------
    // Dry-run hooks and health
    // ------------------------------------------------------------------

    pub async fn test_auth(&self, cancel: &CancellationToken) -> TrackerTestReport {
        match self.authenticate(cancel).await {
            Ok(()) => TrackerTestReport {
                operation: "auth".into(),
                ok: true,
                message: "authentication succeeded".into(),
            },
            Err(e) => TrackerTestReport {
                operation: "auth".into(),
                ok: false,
                message: e.to_string(),
            },
        }
    }

    pub async fn test_search(&self) -> TrackerTestReport {
        let query = if self.schema.search.default_query.is_empty() {
            "2024"
        } else {
            &self.schema.search.default_query
        };
        match self.search(query).await {
            Ok(hits) => TrackerTestReport {
                operation: "search".into(),
                ok: true,
                message: format!("search returned {} result(s)", hits.len()),
            },
            Err(e) => TrackerTestReport {
                operation: "search".into(),
                ok: false,
                message: e.to_string(),
            },
        }
    }

    /// Resolve and validate the full upload payload, stopping before
    /// transmission.
    pub fn test_upload(&self, ctx: &UploadContext) -> TrackerTestReport {
        let validation_errors = self.validate_context(ctx);
        if !validation_errors.is_empty() {
            return TrackerTestReport {
                operation: "upload".into(),
                ok: false,
                message: validation_errors.join("; "),
            };
        }
        match self.assemble_form_parts(ctx) {
            Ok(parts) => TrackerTestReport {
                operation: "upload".into(),
                ok: true,
                message: format!("{} form part(s) resolved; not transmitted", parts.len()),
            },
            Err(e) => TrackerTestReport {
                operation: "upload".into(),
                ok: false,
                message: e.to_string(),
            },
        }
    }

    pub async fn health_check(&self, cancel: &CancellationToken) -> AdapterHealth {
        let breaker_state = self
            .schema
            .cloudflare
            .enabled
            .then(|| self.registry.breaker("flaresolverr").state());

        match self.authenticate(cancel).await {
            Ok(()) => AdapterHealth {
                healthy: true,
                tracker_reachable: true,
                authenticated: true,
                breaker_state,
            },
            Err(PipelineError::AuthRejected(_)) => AdapterHealth {
                healthy: false,
                tracker_reachable: true,
                authenticated: false,
                breaker_state,
            },
            Err(_) => AdapterHealth {
                healthy: false,
                tracker_reachable: false,
                authenticated: false,
                breaker_state,
            },
        }
    }
}

/// Resolve the ordered field list against a context. Deterministic: the
/// same schema and context always produce the same parts in the same
/// order.
pub fn assemble_form_parts(
    fields: &[UploadField],
    ctx: &UploadContext,
) -> Result<Vec<FormPart>, PipelineError> {
    let mut parts = Vec::new();

    for field in fields {
        match field.field_type {
            FieldType::File => {
                let Some(payload) = ctx.files.get(&field.source) else {
                    if field.required {
                        return Err(PipelineError::Validation(format!(
                            "missing required file field: {}",
                            field.source
                        )));
                    }
                    continue;
                };
                let filename = field
                    .filename
                    .clone()
                    .map(|template| {
                        let release = ctx
                            .lookup("release_name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("release");
                        template.replace("{release_name}", release)
                    })
                    .unwrap_or_else(|| payload.filename.clone());
                parts.push(FormPart::File {
                    name: field.name.clone(),
                    source: field.source.clone(),
                    filename,
                });
                continue;
            }
            _ => {}
        }

        let value = ctx
            .lookup(&field.source)
            .filter(|v| !v.is_null())
            .cloned()
            .or_else(|| field.default.clone());

        let Some(value) = value else {
            if field.required {
                return Err(PipelineError::Validation(format!(
                    "missing required field: {}",
                    field.source
                )));
            }
            continue;
        };

        match field.field_type {
            FieldType::Repeated => {
                // Same key repeated per element; never a JSON array
                let elements = match value {
                    Value::Array(items) => items,
                    single => vec![single],
                };
                for element in elements {
                    parts.push(FormPart::Text {
                        name: field.name.clone(),
                        value: stringify_scalar(&element),
                    });
                }
            }
            FieldType::Json => parts.push(FormPart::Text {
                name: field.name.clone(),
                value: serde_json::to_string(&value).unwrap_or_default(),
            }),
            FieldType::Boolean => {
                let truthy = match &value {
                    Value::Bool(b) => *b,
                    Value::String(s) => s == "true" || s == "1",
                    Value::Number(n) => n.as_i64() == Some(1),
                    _ => false,
                };
                parts.push(FormPart::Text {
                    name: field.name.clone(),
                    value: if truthy { "true" } else { "false" }.to_string(),
                });
            }
            FieldType::Number | FieldType::String => parts.push(FormPart::Text {
                name: field.name.clone(),
                value: stringify_scalar(&value),
            }),
            FieldType::File => unreachable!("handled above"),
        }
    }

    Ok(parts)
}

fn stringify_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Materialize parts into a reqwest multipart form.
fn build_multipart(
    parts: &[FormPart],
    files: &HashMap<String, FilePayload>,
) -> Result<reqwest::multipart::Form, PipelineError> {
    let mut form = reqwest::multipart::Form::new();
    for part in parts {
        match part {
            FormPart::Text { name, value } => {
                form = form.text(name.clone(), value.clone());
            }
            FormPart::File { name, source, filename } => {
                let payload = files.get(source).ok_or_else(|| {
                    PipelineError::Validation(format!("file payload '{source}' vanished"))
                })?;
                let file_part = reqwest::multipart::Part::bytes(payload.bytes.clone())
                    .file_name(filename.clone())
                    .mime_str(&payload.content_type)
                    .map_err(|e| {
                        PipelineError::Validation(format!("invalid content type: {e}"))
                    })?;
                form = form.part(name.clone(), file_part);
            }
        }
    }
    Ok(form)
}

fn json_search_hit(item: &Value) -> Option<SearchHit> {
    let obj = item.as_object()?;
    let string_of = |keys: &[&str]| {
        keys.iter().find_map(|k| {
            obj.get(*k).and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        })
    };
    let int_of = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| obj.get(*k).and_then(|v| v.as_i64()))
            .unwrap_or(0)
    };

    let title = string_of(&["name", "title"])?;
    Some(SearchHit {
        title,
        tmdb_id: obj
            .get("tmdbId")
            .or_else(|| obj.get("tmdb_id"))
            .and_then(|v| v.as_i64()),
        imdb_id: string_of(&["imdbId", "imdb_id"]),
        size: int_of(&["size"]),
        seeders: int_of(&["seeders"]) as i32,
        leechers: int_of(&["leechers"]) as i32,
        url: string_of(&["link", "download_link", "url"]),
        torrent_id: string_of(&["id", "guid", "infoHash"]),
    })
}

/// Strip the year and everything after it to get a searchable title.
fn title_from_release_name(release_name: &str) -> String {
    let re = Regex::new(r"[.\s]+(19|20)\d{2}.*").unwrap();
    let title = re.replace(release_name, "").replace('.', " ");
    title.chars().take(200).collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::schema::load_schema;
    use serde_json::json;

    fn demo_schema() -> TrackerSchema {
        load_schema(crate::tracker::schema::tests::DEMO_SCHEMA).unwrap()
    }

    fn demo_adapter() -> TrackerAdapter {
        TrackerAdapter::new(
            demo_schema(),
            Some("key-123".into()),
            Some("passkey-456789".into()),
            Arc::new(ServiceRegistry::new()),
            None,
        )
    }

    fn demo_context() -> UploadContext {
        UploadContext::new(json!({
            "release_name": "The.Movie.2021.1080p.WEB-DL.H264-X",
            "tag_ids": [10, 15, 20],
            "anonymous": false,
            "metadata": { "title": "The Movie" },
        }))
        .with_file(
            "torrent_data",
            FilePayload {
                filename: "The.Movie.torrent".into(),
                bytes: vec![1, 2, 3],
                content_type: "application/x-bittorrent".into(),
            },
        )
    }

    #[test]
    fn test_repeated_field_emits_one_part_per_value() {
        let adapter = demo_adapter();
        let parts = adapter.assemble_form_parts(&demo_context()).unwrap();

        let tags: Vec<&FormPart> = parts
            .iter()
            .filter(|p| matches!(p, FormPart::Text { name, .. } if name == "tag_ids"))
            .collect();
        assert_eq!(tags.len(), 3);
        assert_eq!(
            tags[0],
            &FormPart::Text {
                name: "tag_ids".into(),
                value: "10".into()
            }
        );
        // Never a JSON array in any text part
        for part in &parts {
            if let FormPart::Text { value, .. } = part {
                assert!(!value.starts_with('['), "JSON array leaked: {value}");
            }
        }
    }

    #[test]
    fn test_field_order_is_schema_order() {
        let adapter = demo_adapter();
        let parts = adapter.assemble_form_parts(&demo_context()).unwrap();
        let names: Vec<&str> = parts
            .iter()
            .map(|p| match p {
                FormPart::Text { name, .. } => name.as_str(),
                FormPart::File { name, .. } => name.as_str(),
            })
            .collect();
        assert_eq!(
            names,
            vec!["torrent", "name", "tag_ids", "tag_ids", "tag_ids", "anonymous"]
        );
    }

    #[test]
    fn test_missing_required_field_fails_before_network() {
        let adapter = demo_adapter();
        let ctx = UploadContext::new(json!({ "tag_ids": [] }));
        let err = adapter.assemble_form_parts(&ctx).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_validation_rules_run_against_context() {
        let adapter = demo_adapter();
        let ctx = UploadContext::new(json!({ "release_name": "Short" }));
        let errors = adapter.validate_context(&ctx);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("too short"));
    }

    #[test]
    fn test_test_upload_stops_before_transmission() {
        let adapter = demo_adapter();
        let report = adapter.test_upload(&demo_context());
        assert!(report.ok, "{}", report.message);
        assert!(report.message.contains("not transmitted"));
    }

    #[test]
    fn test_upload_response_parsing() {
        let adapter = demo_adapter();
        let outcome = adapter.parse_upload_response(
            200,
            r#"{"success": true, "data": {"id": 4242}}"#,
        );
        assert!(outcome.success);
        assert_eq!(outcome.torrent_id.as_deref(), Some("4242"));
        assert_eq!(
            outcome.torrent_url.as_deref(),
            Some("https://demo.example/torrent/4242")
        );
    }

    #[test]
    fn test_upload_response_error_field() {
        let adapter = demo_adapter();
        let outcome = adapter
            .parse_upload_response(200, r#"{"success": false, "error": "name taken"}"#);
        assert!(!outcome.success);
        assert_eq!(outcome.message, "name taken");
    }

    #[test]
    fn test_announce_url_carries_passkey() {
        let adapter = demo_adapter();
        assert_eq!(
            adapter.announce_url().as_deref(),
            Some("https://demo.example/announce?passkey=passkey-456789")
        );
    }

    #[test]
    fn test_category_resolution_prefers_specific() {
        let adapter = demo_adapter();
        assert_eq!(adapter.category_id(Some("1080p")).as_deref(), Some("9"));
        assert_eq!(adapter.category_id(Some("720p")).as_deref(), Some("1"));
        assert_eq!(adapter.category_id(None).as_deref(), Some("1"));
    }

    #[test]
    fn test_release_name_sanitize_pipeline() {
        let adapter = demo_adapter();
        assert_eq!(
            adapter.release_name_for("The Movie  2021"),
            "The.Movie.2021"
        );
    }

    #[test]
    fn test_title_from_release_name() {
        assert_eq!(
            title_from_release_name("The.Movie.2021.1080p.WEB-DL.H264-X"),
            "The Movie"
        );
        assert_eq!(title_from_release_name("NoYearHere"), "NoYearHere");
    }

    #[test]
    fn test_json_search_hit_field_conventions() {
        let hit = json_search_hit(&json!({
            "title": "Some.Release.2020.1080p",
            "id": 77,
            "size": 1234,
            "seeders": 5,
            "leechers": 2,
            "tmdbId": 550
        }))
        .unwrap();
        assert_eq!(hit.torrent_id.as_deref(), Some("77"));
        assert_eq!(hit.tmdb_id, Some(550));
        assert_eq!(hit.seeders, 5);
    }

    #[test]
    fn test_parse_search_body_json_with_path() {
        let adapter = demo_adapter();
        let hits = adapter
            .parse_search_body(r#"{"data": [{"name": "A.Release", "id": 1, "size": 10}]}"#)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "A.Release");
    }

    #[test]
    fn test_parse_search_body_auto_detects_xml() {
        let adapter = demo_adapter();
        let xml = r#"<?xml version="1.0"?>
<rss xmlns:torznab="http://torznab.com/schemas/2015/feed"><channel>
<item><title>X.2020</title><guid>g1</guid><torznab:attr name="seeders" value="3"/></item>
</channel></rss>"#;
        let hits = adapter.parse_search_body(xml).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].seeders, 3);
    }
}
