//! Image host upload client
//!
//! Screenshots captured during Prepare are uploaded here and the
//! resulting URLs embedded in the rendered presentation. The API shape
//! follows the imgbb-style `POST` with a base64 image field and a JSON
//! `data.url` response.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::services::rate_limiter::{retry_with_backoff, RetryConfig};
use crate::services::registry::ServiceRegistry;

#[derive(Debug, Deserialize)]
struct UploadResponse {
    data: Option<UploadData>,
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Deserialize)]
struct UploadData {
    url: Option<String>,
    display_url: Option<String>,
}

pub struct ImageHostClient {
    client: reqwest::Client,
    upload_url: String,
    api_key: String,
    registry: Arc<ServiceRegistry>,
    retry: RetryConfig,
}

impl ImageHostClient {
    pub fn new(upload_url: String, api_key: String, registry: Arc<ServiceRegistry>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("failed to build HTTP client"),
            upload_url,
            api_key,
            registry,
            retry: RetryConfig::default(),
        }
    }

    /// Upload an image, returning its public URL.
    pub async fn upload(
        &self,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        let encoded = STANDARD.encode(bytes);

        retry_with_backoff("image_upload", &self.retry, cancel, || async {
            self.registry.rate_limiter().acquire("image", "upload").await;
            debug!(size = bytes.len(), "Uploading screenshot");

            let response = self
                .client
                .post(&self.upload_url)
                .form(&[("key", self.api_key.as_str()), ("image", encoded.as_str())])
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

            let parsed: UploadResponse = response
                .json()
                .await
                .map_err(PipelineError::from_reqwest)?;

            let url = parsed
                .data
                .and_then(|d| d.display_url.or(d.url))
                .filter(|_| parsed.success);

            match url {
                Some(url) => {
                    info!(url = %url, "Screenshot uploaded");
                    Ok(url)
                }
                None => Err(PipelineError::Permanent {
                    status: status.as_u16(),
                    message: "image host response missing URL".into(),
                }),
            }
        })
        .await
    }
}
