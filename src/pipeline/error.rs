use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::md5_fix::Md5FixError;
use super::packaging::PackagingError;
use super::probe::ProbeError;
use super::quality::{FetchError, QualityAttempt};
use super::transcode::TranscodeError;
use crate::catalog::CatalogError;
use crate::storage::StorageError;

/// Why a work item landed in the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    ShorterThanExpected,
    NetworkError,
    QualityUnavailable,
    ProcessingError,
    UnknownError,
}

impl RetryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::ShorterThanExpected => "shorter_than_expected",
            RetryReason::NetworkError => "network_error",
            RetryReason::QualityUnavailable => "quality_unavailable",
            RetryReason::ProcessingError => "processing_error",
            RetryReason::UnknownError => "unknown_error",
        }
    }

    pub fn is_auto_retryable(&self) -> bool {
        !matches!(self, RetryReason::UnknownError)
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fully processed file that failed validation but can still be saved on request.
#[derive(Clone, PartialEq)]
pub struct DegradedOutput {
    pub artist_folder: String,
    pub album_folder: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for DegradedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DegradedOutput")
            .field("artist_folder", &self.artist_folder)
            .field("album_folder", &self.album_folder)
            .field("file_name", &self.file_name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("download cancelled")]
    Cancelled,

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("no qualities available")]
    NoQualities,

    #[error("all quality tiers failed after {} attempts", .attempts.len())]
    QualityExhausted { attempts: Vec<QualityAttempt> },

    #[error("file too large: {size} bytes (max: {max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("transcoding failed: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("hash fix failed: {0}")]
    HashFix(#[from] Md5FixError),

    #[error("duration probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("packaging failed: {0}")]
    Packaging(#[from] PackagingError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("decoded duration {actual_ms}ms is shorter than expected {expected_ms}ms")]
    ShorterThanExpected {
        expected_ms: u64,
        actual_ms: u64,
        output: Arc<DegradedOutput>,
    },

    #[error("not streamable: {0}")]
    NotStreamable(String),

    /// Album rerun where some tracks still failed, as (track title, error) pairs.
    #[error("{} album tracks failed: {}", .failures.len(), summarize(.failures))]
    AlbumIncomplete {
        failures: Vec<(String, PipelineError)>,
    },
}

fn summarize(failures: &[(String, PipelineError)]) -> String {
    failures
        .iter()
        .map(|(title, error)| format!("{}: {}", title, error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::NoQualities => PipelineError::NoQualities,
            FetchError::QualityExhausted { attempts } => {
                PipelineError::QualityExhausted { attempts }
            }
            FetchError::Cancelled => PipelineError::Cancelled,
        }
    }
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled
                | PipelineError::Catalog(CatalogError::Cancelled)
                | PipelineError::Transcode(TranscodeError::Cancelled(_))
        )
    }

    /// Retry classification; `None` means the failure is final.
    pub fn retry_reason(&self) -> Option<RetryReason> {
        if self.is_cancelled() {
            return None;
        }
        match self {
            PipelineError::TooLarge { .. }
            | PipelineError::Storage(StorageError::TooLarge { .. })
            | PipelineError::NoQualities
            | PipelineError::NotStreamable(_) => None,
            PipelineError::Catalog(e) if e.is_transport() => Some(RetryReason::NetworkError),
            PipelineError::QualityExhausted { .. } => Some(RetryReason::QualityUnavailable),
            PipelineError::Transcode(_)
            | PipelineError::HashFix(_)
            | PipelineError::Probe(_)
            | PipelineError::Packaging(_) => Some(RetryReason::ProcessingError),
            PipelineError::ShorterThanExpected { .. } => Some(RetryReason::ShorterThanExpected),
            // The first track that can still be retried decides.
            PipelineError::AlbumIncomplete { failures } => {
                failures.iter().find_map(|(_, error)| error.retry_reason())
            }
            _ => Some(RetryReason::UnknownError),
        }
    }

    /// The processed file held back by a failed duration check.
    pub fn degraded_output(&self) -> Option<Arc<DegradedOutput>> {
        match self {
            PipelineError::ShorterThanExpected { output, .. } => Some(output.clone()),
            _ => None,
        }
    }
}
