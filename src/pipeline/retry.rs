//! Retry queue for failed, retryable downloads.
//!
//! Items carry everything needed to run the download again: the catalog item, the
//! settings snapshot and, for album tracks, the album metadata. Re-running is
//! delegated to a [`RetryRunner`] handed in at construction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{DegradedOutput, PipelineError, RetryReason};
use crate::catalog::{CatalogItem, FetchedAlbum};
use crate::config::DownloadSettings;

/// Budget for items retried automatically.
pub const AUTO_MAX_ATTEMPTS: u32 = 3;
/// Budget for items the user retries by hand.
pub const MANUAL_MAX_ATTEMPTS: u32 = 1;

#[async_trait]
pub trait RetryRunner: Send + Sync {
    /// Runs `item` again; stops with a cancelled error once `cancel` fires.
    async fn rerun(&self, item: &RetryItem, cancel: &CancellationToken) -> Result<(), PipelineError>;
}

/// Input to [`RetryQueue::add_item`].
#[derive(Debug, Clone)]
pub struct NewRetryItem {
    pub item: CatalogItem,
    pub settings: DownloadSettings,
    pub album: Option<FetchedAlbum>,
    pub reason: RetryReason,
    pub error: String,
    pub auto_retry: bool,
    pub degraded: Option<Arc<DegradedOutput>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryItem {
    pub id: String,
    pub item: CatalogItem,
    pub settings: DownloadSettings,
    pub album: Option<FetchedAlbum>,
    pub reason: RetryReason,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub auto_retry: bool,
    /// Output held back by a failed duration check, kept for "save anyway".
    #[serde(skip)]
    pub degraded: Option<Arc<DegradedOutput>>,
}

impl RetryItem {
    pub fn title(&self) -> String {
        self.item.title()
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// The rerun succeeded; the item is gone.
    Succeeded,
    /// The rerun failed and the item stays queued.
    Failed { attempts: u32, error: String },
    /// The rerun failed for the last time, or with a final error; the item is gone.
    Exhausted { error: String },
    /// The rerun was cancelled; the attempt is not charged.
    Cancelled,
    NotFound,
    AlreadyRetrying,
}

#[derive(Default)]
struct QueueState {
    items: Vec<RetryItem>,
    retrying: HashSet<String>,
}

pub struct RetryQueue {
    state: Mutex<QueueState>,
    runner: Arc<dyn RetryRunner>,
}

impl RetryQueue {
    pub fn new(runner: Arc<dyn RetryRunner>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            runner,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends an item with a fresh id and no attempts. Returns the id.
    pub fn add_item(&self, new: NewRetryItem) -> String {
        let item = RetryItem {
            id: Uuid::new_v4().to_string(),
            item: new.item,
            settings: new.settings,
            album: new.album,
            reason: new.reason,
            attempts: 0,
            max_attempts: if new.auto_retry {
                AUTO_MAX_ATTEMPTS
            } else {
                MANUAL_MAX_ATTEMPTS
            },
            last_error: new.error,
            created_at: Utc::now(),
            auto_retry: new.auto_retry,
            degraded: new.degraded,
        };
        info!(
            "Added \"{}\" to retry queue ({}): {}",
            item.title(),
            item.reason,
            item.last_error
        );
        let id = item.id.clone();
        self.lock().items.push(item);
        id
    }

    pub fn remove_item(&self, id: &str) -> Option<RetryItem> {
        let mut state = self.lock();
        let position = state.items.iter().position(|i| i.id == id)?;
        Some(state.items.remove(position))
    }

    pub fn get(&self, id: &str) -> Option<RetryItem> {
        self.lock().items.iter().find(|i| i.id == id).cloned()
    }

    pub fn items(&self) -> Vec<RetryItem> {
        self.lock().items.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn clear_all(&self) {
        let mut state = self.lock();
        debug!("Clearing {} retry items", state.items.len());
        state.items.clear();
    }

    /// Runs the item again under `cancel`, charging one attempt.
    pub async fn retry_item(&self, id: &str, cancel: &CancellationToken) -> RetryOutcome {
        let item = {
            let mut state = self.lock();
            if state.retrying.contains(id) {
                return RetryOutcome::AlreadyRetrying;
            }
            let Some(position) = state.items.iter().position(|i| i.id == id) else {
                return RetryOutcome::NotFound;
            };
            if !state.items[position].has_attempts_left() {
                let item = state.items.remove(position);
                return RetryOutcome::Exhausted {
                    error: item.last_error,
                };
            }
            let item = &mut state.items[position];
            item.attempts += 1;
            let snapshot = item.clone();
            state.retrying.insert(id.to_string());
            snapshot
        };

        info!(
            "Retrying \"{}\" (attempt {}/{})",
            item.title(),
            item.attempts,
            item.max_attempts
        );
        let result = self.runner.rerun(&item, cancel).await;

        let mut state = self.lock();
        state.retrying.remove(id);
        let position = state.items.iter().position(|i| i.id == id);

        match result {
            Ok(()) => {
                info!("Retry of \"{}\" succeeded", item.title());
                if let Some(position) = position {
                    state.items.remove(position);
                }
                RetryOutcome::Succeeded
            }
            Err(e) if e.is_cancelled() => {
                debug!("Retry of \"{}\" cancelled", item.title());
                if let Some(position) = position {
                    let stored = &mut state.items[position];
                    stored.attempts = stored.attempts.saturating_sub(1);
                }
                RetryOutcome::Cancelled
            }
            Err(e) => {
                let error = e.to_string();
                let reason = e.retry_reason();
                let Some(position) = position else {
                    return RetryOutcome::Exhausted { error };
                };
                let stored = &mut state.items[position];
                match reason {
                    Some(reason) if stored.has_attempts_left() => {
                        warn!(
                            "Retry of \"{}\" failed (attempt {}/{}): {}",
                            stored.title(),
                            stored.attempts,
                            stored.max_attempts,
                            error
                        );
                        stored.reason = reason;
                        stored.last_error = error.clone();
                        if let Some(output) = e.degraded_output() {
                            stored.degraded = Some(output);
                        }
                        RetryOutcome::Failed {
                            attempts: stored.attempts,
                            error,
                        }
                    }
                    _ => {
                        warn!(
                            "Giving up on \"{}\" after {} attempts: {}",
                            stored.title(),
                            stored.attempts,
                            error
                        );
                        state.items.remove(position);
                        RetryOutcome::Exhausted { error }
                    }
                }
            }
        }
    }

    /// Retries, one after another, every item with attempts left.
    pub async fn retry_all(&self, cancel: &CancellationToken) -> Vec<(String, RetryOutcome)> {
        let ids: Vec<String> = {
            let state = self.lock();
            state
                .items
                .iter()
                .filter(|i| i.has_attempts_left() && !state.retrying.contains(&i.id))
                .map(|i| i.id.clone())
                .collect()
        };
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = self.retry_item(&id, cancel).await;
            outcomes.push((id, outcome));
        }
        outcomes
    }
}
