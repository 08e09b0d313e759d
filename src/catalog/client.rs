//! HTTP client for the catalog backend.
//!
//! Every JSON endpoint answers with an envelope `{"success": bool, "data": ..., "error": ...}`.

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    CatalogClient, CatalogError, FetchedAlbum, QualityTier, ReleasePage, ReleaseType, Track,
};

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUrl {
    url: String,
}

/// HTTP client for the catalog backend.
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpCatalogClient {
    /// Create a new catalog client.
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the catalog backend (e.g., "http://localhost:3000")
    /// * `timeout_sec` - Timeout for metadata requests; audio transfers are only bounded
    ///   by the connect timeout and cancellation
    pub fn new(base_url: &str, timeout_sec: u64) -> Result<Self, CatalogError> {
        let request_timeout = Duration::from_secs(timeout_sec);
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| CatalogError::Network(format!("failed to create HTTP client: {}", e)))?;

        // Ensure base_url doesn't have trailing slash
        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            request_timeout,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, CatalogError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {} {:?}", url, query);
        let response = self
            .client
            .get(&url)
            .query(query)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiResponse<serde_json::Value>>(&body)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| format!("{} {}", url, status));
            return Err(CatalogError::from_status(status.as_u16(), message));
        }

        let envelope: ApiResponse<T> = response.json().await?;
        if !envelope.success {
            return Err(CatalogError::InvalidResponse(
                envelope
                    .error
                    .unwrap_or_else(|| format!("request to {} was not successful", path)),
            ));
        }
        envelope
            .data
            .ok_or_else(|| CatalogError::InvalidResponse(format!("{} returned no data", path)))
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn resolve_stream_url(
        &self,
        track_id: u64,
        tier: QualityTier,
    ) -> Result<String, CatalogError> {
        let stream: StreamUrl = self
            .get_json(
                "/api/download-music",
                &[
                    ("track_id", track_id.to_string()),
                    ("quality", tier.as_str().to_string()),
                ],
            )
            .await?;
        Ok(stream.url)
    }

    async fn fetch_track(&self, track_id: u64) -> Result<Track, CatalogError> {
        self.get_json("/api/get-track", &[("track_id", track_id.to_string())])
            .await
    }

    async fn fetch_album(&self, album_id: &str) -> Result<FetchedAlbum, CatalogError> {
        self.get_json("/api/get-album", &[("album_id", album_id.to_string())])
            .await
    }

    async fn fetch_artist_releases(
        &self,
        artist_id: &str,
        release_type: ReleaseType,
        offset: u32,
        limit: u32,
    ) -> Result<ReleasePage, CatalogError> {
        self.get_json(
            "/api/get-releases",
            &[
                ("artist_id", artist_id.to_string()),
                ("release_type", release_type.as_str().to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    async fn fetch_bytes(
        &self,
        url: &str,
        cancel: &CancellationToken,
        progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
    ) -> Result<Vec<u8>, CatalogError> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CatalogError::Cancelled),
            response = self.client.get(url).send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::from_status(
                status.as_u16(),
                format!("audio fetch failed with status {}", status),
            ));
        }

        let total = response.content_length();
        let mut buffer = Vec::with_capacity(total.unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(CatalogError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(chunk) => {
                    buffer.extend_from_slice(&chunk?);
                    progress(buffer.len() as u64, total);
                }
                None => break,
            }
        }

        if let Some(total) = total {
            if (buffer.len() as u64) < total {
                return Err(CatalogError::Network(format!(
                    "connection closed after {} of {} bytes",
                    buffer.len(),
                    total
                )));
            }
        }
        Ok(buffer)
    }
}
