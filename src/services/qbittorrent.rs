//! qBittorrent Web API client
//!
//! After a successful tracker upload the generated torrent is injected
//! into qBittorrent so seeding starts immediately. Only the small slice
//! of the Web API the pipeline needs is wrapped here.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::services::registry::ServiceRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct SeedClientStatus {
    pub reachable: bool,
    pub version: Option<String>,
}

pub struct QbittorrentClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    registry: Arc<ServiceRegistry>,
}

impl QbittorrentClient {
    pub fn new(
        base_url: String,
        username: String,
        password: String,
        registry: Arc<ServiceRegistry>,
    ) -> Self {
        Self {
            // Cookie store keeps the SID session cookie across calls
            client: reqwest::Client::builder()
                .cookie_store(true)
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
            registry,
        }
    }

    async fn login(&self) -> Result<(), PipelineError> {
        self.registry
            .rate_limiter()
            .acquire("qbittorrent", "request")
            .await;

        let response = self
            .client
            .post(format!("{}/api/v2/auth/login", self.base_url))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(PipelineError::from_reqwest)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() || body.trim() != "Ok." {
            return Err(PipelineError::AuthRejected(format!(
                "qBittorrent login failed (HTTP {}): {}",
                status.as_u16(),
                body.chars().take(100).collect::<String>()
            )));
        }

        debug!("qBittorrent session established");
        Ok(())
    }

    /// Add a torrent for seeding. The media is already at its final
    /// location, so the save path points there and a recheck matches the
    /// existing data.
    pub async fn add_torrent(
        &self,
        torrent_bytes: Vec<u8>,
        save_path: &str,
        category: Option<&str>,
    ) -> Result<(), PipelineError> {
        self.login().await?;
        self.registry
            .rate_limiter()
            .acquire("qbittorrent", "request")
            .await;

        let torrent_part = reqwest::multipart::Part::bytes(torrent_bytes)
            .file_name("release.torrent")
            .mime_str("application/x-bittorrent")
            .map_err(|e| PipelineError::Validation(format!("invalid torrent part: {e}")))?;

        let mut form = reqwest::multipart::Form::new()
            .part("torrents", torrent_part)
            .text("savepath", save_path.to_string())
            .text("skip_checking", "false".to_string());
        if let Some(category) = category {
            form = form.text("category", category.to_string());
        }

        let response = self
            .client
            .post(format!("{}/api/v2/torrents/add", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(PipelineError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status(
                status.as_u16(),
                format!("torrent injection failed: {body}"),
            ));
        }

        info!(save_path = save_path, "Torrent added to seed client");
        Ok(())
    }

    pub async fn get_status(&self) -> SeedClientStatus {
        if self.login().await.is_err() {
            return SeedClientStatus {
                reachable: false,
                version: None,
            };
        }

        let version = self
            .client
            .get(format!("{}/api/v2/app/version", self.base_url))
            .send()
            .await
            .ok();

        match version {
            Some(response) if response.status().is_success() => SeedClientStatus {
                reachable: true,
                version: response.text().await.ok(),
            },
            _ => SeedClientStatus {
                reachable: false,
                version: None,
            },
        }
    }
}
