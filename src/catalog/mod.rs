//! Remote catalog collaborator.
//!
//! The pipeline only talks to the catalog through [`CatalogClient`]; the binary uses
//! [`HttpCatalogClient`], tests substitute in-memory fakes.

mod client;
mod models;

pub use client::HttpCatalogClient;
pub use models::{
    Album, AlbumArtist, AlbumImage, ArtistRef, CatalogItem, FetchedAlbum, Genre, Label,
    QualityTier, ReleasePage, ReleaseType, Track, TrackPage, VARIOUS_ARTISTS,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("catalog returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request cancelled")]
    Cancelled,
}

impl CatalogError {
    /// Maps an HTTP failure status to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 404 {
            CatalogError::NotFound(message)
        } else {
            CatalogError::Status { status, message }
        }
    }

    /// Transport level failures: connection problems, timeouts, throttling,
    /// forbidden links and upstream server errors.
    pub fn is_transport(&self) -> bool {
        match self {
            CatalogError::Network(_) | CatalogError::Timeout => true,
            CatalogError::Status { status, .. } => {
                *status == 429 || *status == 403 || (500..=599).contains(status)
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for CatalogError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CatalogError::Timeout
        } else if err.is_decode() {
            CatalogError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            CatalogError::from_status(status.as_u16(), err.to_string())
        } else {
            CatalogError::Network(err.to_string())
        }
    }
}

/// Operations the pipeline needs from the catalog backend.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Resolves a time-limited, directly fetchable audio URL for one quality tier.
    async fn resolve_stream_url(
        &self,
        track_id: u64,
        tier: QualityTier,
    ) -> Result<String, CatalogError>;

    async fn fetch_track(&self, track_id: u64) -> Result<Track, CatalogError>;

    async fn fetch_album(&self, album_id: &str) -> Result<FetchedAlbum, CatalogError>;

    async fn fetch_artist_releases(
        &self,
        artist_id: &str,
        release_type: ReleaseType,
        offset: u32,
        limit: u32,
    ) -> Result<ReleasePage, CatalogError>;

    /// Downloads `url` fully, honouring `cancel` between chunks. `progress` receives
    /// the bytes received so far and the total when the server announces it.
    async fn fetch_bytes(
        &self,
        url: &str,
        cancel: &CancellationToken,
        progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
    ) -> Result<Vec<u8>, CatalogError>;
}
