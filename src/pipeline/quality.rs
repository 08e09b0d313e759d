//! Quality-fallback download engine.
//!
//! Tries the requested tier first and walks down the tier list until one tier both
//! resolves and streams successfully. Only transport success is checked here.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{CatalogClient, CatalogError, QualityTier, Track};

/// One try at one tier.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityAttempt {
    pub tier: QualityTier,
    pub label: &'static str,
    pub success: bool,
    pub error: Option<String>,
}

/// Payload of a successful fetch.
#[derive(Debug)]
pub struct FetchedStream {
    pub buffer: Vec<u8>,
    pub actual_quality: QualityTier,
    pub fallback_used: bool,
    pub attempts: Vec<QualityAttempt>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no qualities available")]
    NoQualities,

    #[error("all quality tiers failed: {}", summarize(.attempts))]
    QualityExhausted { attempts: Vec<QualityAttempt> },

    #[error("download cancelled")]
    Cancelled,
}

fn summarize(attempts: &[QualityAttempt]) -> String {
    attempts
        .iter()
        .map(|a| {
            format!(
                "{} ({})",
                a.tier,
                a.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Tiers to try for `requested`: the requested tier and everything below it.
/// A tier outside `tiers` tries the whole list.
pub fn fallback_order(requested: QualityTier, tiers: &[QualityTier]) -> Vec<QualityTier> {
    match tiers.iter().position(|t| *t == requested) {
        Some(start) => tiers[start..].to_vec(),
        None => tiers.to_vec(),
    }
}

pub struct QualityFallbackEngine {
    catalog: Arc<dyn CatalogClient>,
}

impl QualityFallbackEngine {
    pub fn new(catalog: Arc<dyn CatalogClient>) -> Self {
        Self { catalog }
    }

    /// Fetches `track` at `requested` or the best lower tier in `tiers`.
    ///
    /// `on_progress` receives non-decreasing percentages of the transfer.
    pub async fn fetch(
        &self,
        track: &Track,
        requested: QualityTier,
        tiers: &[QualityTier],
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<FetchedStream, FetchError> {
        let order = fallback_order(requested, tiers);
        if order.is_empty() {
            return Err(FetchError::NoQualities);
        }

        let reported = AtomicU8::new(0);
        let progress = |received: u64, total: Option<u64>| {
            if let Some(total) = total.filter(|t| *t > 0) {
                let percent = ((received.min(total) * 100) / total) as u8;
                if reported.fetch_max(percent, Ordering::SeqCst) < percent {
                    on_progress(percent);
                }
            }
        };

        let mut attempts = Vec::with_capacity(order.len());
        for tier in order {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let result = match self.catalog.resolve_stream_url(track.id, tier).await {
                Ok(url) => self.catalog.fetch_bytes(&url, cancel, &progress).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(buffer) => {
                    attempts.push(QualityAttempt {
                        tier,
                        label: tier.label(),
                        success: true,
                        error: None,
                    });
                    let fallback_used = tier != requested;
                    if fallback_used {
                        info!(
                            "Track {} fetched at fallback quality {} (requested {})",
                            track.id, tier, requested
                        );
                    }
                    return Ok(FetchedStream {
                        buffer,
                        actual_quality: tier,
                        fallback_used,
                        attempts,
                    });
                }
                Err(CatalogError::Cancelled) => return Err(FetchError::Cancelled),
                Err(e) => {
                    warn!("Track {} unavailable at quality {}: {}", track.id, tier, e);
                    attempts.push(QualityAttempt {
                        tier,
                        label: tier.label(),
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        Err(FetchError::QualityExhausted { attempts })
    }
}
