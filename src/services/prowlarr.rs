//! Prowlarr Torznab client
//!
//! Optional cross-check used by the duplicate check: when a tracker's
//! schema carries Prowlarr hints, its indexer can be queried through
//! Prowlarr as a second opinion before upload.

use std::sync::Arc;

use tracing::debug;

use crate::error::PipelineError;
use crate::services::registry::ServiceRegistry;
use crate::tracker::torznab::{parse_torznab, TorznabItem};

pub struct ProwlarrClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    registry: Arc<ServiceRegistry>,
}

impl ProwlarrClient {
    pub fn new(base_url: String, api_key: String, registry: Arc<ServiceRegistry>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            registry,
        }
    }

    /// Movie search across all indexers, or one indexer when named.
    pub async fn search_movie(
        &self,
        query: &str,
        indexer: Option<&str>,
    ) -> Result<Vec<TorznabItem>, PipelineError> {
        self.registry
            .rate_limiter()
            .acquire("prowlarr", "search")
            .await;

        let indexer = indexer.unwrap_or("all");
        let url = format!("{}/api/v1/indexer/{indexer}/torznab", self.base_url);
        debug!(url = %url, query = query, "Prowlarr search");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("apikey", self.api_key.as_str()),
                ("t", "movie"),
                ("q", query),
            ])
            .send()
            .await
            .map_err(PipelineError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status(
                status.as_u16(),
                body.chars().take(200).collect::<String>(),
            ));
        }

        let body = response.text().await.map_err(PipelineError::from_reqwest)?;
        parse_torznab(&body).map_err(|e| PipelineError::Permanent {
            status: 0,
            message: format!("unparseable Prowlarr response: {e}"),
        })
    }
}
