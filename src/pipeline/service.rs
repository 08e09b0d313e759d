//! Download service: the entry point the binary talks to.
//!
//! Turns user requests into scheduler jobs, routes failures into the retry queue and
//! publishes [`DownloadNotice`]s for anything the user should hear about.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{PipelineError, RetryReason};
use super::orchestrator::DownloadOrchestrator;
use super::progress::ProgressTracker;
use super::retry::{NewRetryItem, RetryItem, RetryOutcome, RetryQueue, RetryRunner};
use super::scheduler::{Job, JobKind, JobScheduler};
use crate::catalog::{CatalogItem, FetchedAlbum, QualityTier, ReleaseType, Track};
use crate::config::DownloadSettings;
use crate::storage::StoredFile;

/// User-facing events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadNotice {
    Saved {
        title: String,
        file_name: String,
        quality: Option<QualityTier>,
    },
    AlbumSaved {
        title: String,
        saved: usize,
        failed: usize,
    },
    QualityFallback {
        title: String,
        requested: QualityTier,
        actual: QualityTier,
    },
    RetryQueued {
        retry_id: String,
        title: String,
        reason: RetryReason,
        error: String,
        auto_retry: bool,
        offer_save_anyway: bool,
    },
    RetrySucceeded {
        retry_id: String,
        title: String,
    },
    Failed {
        title: String,
        error: String,
        attempts: Option<(u32, u32)>,
    },
    Cancelled {
        title: String,
    },
}

/// Re-runs retry items through the orchestrator under the retry job's token.
struct OrchestratorRunner {
    orchestrator: Arc<DownloadOrchestrator>,
}

#[async_trait]
impl RetryRunner for OrchestratorRunner {
    async fn rerun(&self, item: &RetryItem, cancel: &CancellationToken) -> Result<(), PipelineError> {
        self.orchestrator.rerun(item, cancel).await
    }
}

struct ServiceInner {
    orchestrator: Arc<DownloadOrchestrator>,
    scheduler: JobScheduler,
    retries: RetryQueue,
    settings: RwLock<DownloadSettings>,
    notices: broadcast::Sender<DownloadNotice>,
    auto_retry_delay: Duration,
    /// Auto-retry loops still waiting or running.
    retry_loops: watch::Sender<usize>,
    root: CancellationToken,
}

#[derive(Clone)]
pub struct DownloadService {
    inner: Arc<ServiceInner>,
}

impl DownloadService {
    pub fn new(
        orchestrator: Arc<DownloadOrchestrator>,
        settings: DownloadSettings,
        auto_retry_delay: Duration,
    ) -> Self {
        let settings = settings.normalized();
        let root = CancellationToken::new();
        let runner = Arc::new(OrchestratorRunner {
            orchestrator: orchestrator.clone(),
        });
        let (notices, _) = broadcast::channel(256);
        let (retry_loops, _) = watch::channel(0);
        Self {
            inner: Arc::new(ServiceInner {
                scheduler: JobScheduler::new(settings.max_concurrent_downloads),
                orchestrator,
                retries: RetryQueue::new(runner),
                settings: RwLock::new(settings),
                notices,
                auto_retry_delay,
                retry_loops,
                root,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadNotice> {
        self.inner.notices.subscribe()
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.inner.scheduler
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.inner.retries
    }

    pub fn progress(&self) -> &ProgressTracker {
        self.inner.orchestrator.progress()
    }

    pub fn settings(&self) -> DownloadSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replaces the settings used by jobs submitted from now on.
    pub fn update_settings(&self, settings: DownloadSettings) {
        let settings = settings.normalized();
        self.inner
            .scheduler
            .set_concurrency_limit(settings.max_concurrent_downloads);
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;
    }

    /// Clamped to 1..=10; running jobs keep running.
    pub fn set_concurrency_limit(&self, limit: usize) {
        let mut settings = self
            .inner
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        settings.max_concurrent_downloads = limit;
        *settings = settings.clone().normalized();
        self.inner
            .scheduler
            .set_concurrency_limit(settings.max_concurrent_downloads);
    }

    fn notify(&self, notice: DownloadNotice) {
        // No subscribers is fine.
        let _ = self.inner.notices.send(notice);
    }

    /// Queues a single track download. Returns the job id.
    pub fn submit_track(&self, track: Track) -> String {
        let service = self.clone();
        let settings = self.settings();
        let title = track.display_title();
        let job = Job::new(title, JobKind::Track, move |token| async move {
            service.run_track(track, None, settings, token).await
        })
        .with_token(self.inner.root.child_token());
        self.inner.scheduler.submit(job)
    }

    /// Queues an album download. `prefetched` skips the metadata request.
    pub fn submit_album(
        &self,
        album_id: impl Into<String>,
        title: Option<String>,
        prefetched: Option<FetchedAlbum>,
    ) -> String {
        let album_id = album_id.into();
        let service = self.clone();
        let settings = self.settings();
        let title = title
            .or_else(|| prefetched.as_ref().map(|f| f.album.display_title()))
            .unwrap_or_else(|| format!("Album {}", album_id));
        let job_title = title.clone();
        let job = Job::new(job_title, JobKind::Album, move |token| async move {
            service
                .run_album(album_id, title, prefetched, settings, token)
                .await
        })
        .with_token(self.inner.root.child_token());
        self.inner.scheduler.submit(job)
    }

    /// Queues one album job per release of the artist. Returns the job ids.
    pub async fn submit_discography(
        &self,
        artist_id: &str,
        release_type: Option<ReleaseType>,
    ) -> anyhow::Result<Vec<String>> {
        let releases = self
            .inner
            .orchestrator
            .artist_releases(artist_id, release_type)
            .await
            .with_context(|| format!("Failed to list releases of artist {}", artist_id))?;
        info!(
            "Queueing {} releases of artist {}",
            releases.len(),
            artist_id
        );
        Ok(releases
            .into_iter()
            .map(|album| {
                let title = album.display_title();
                self.submit_album(album.id, Some(title), None)
            })
            .collect())
    }

    /// Cancels a pending or running job.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        self.inner.scheduler.cancel(job_id)
    }

    async fn run_track(
        &self,
        track: Track,
        album: Option<FetchedAlbum>,
        settings: DownloadSettings,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        let result = self
            .inner
            .orchestrator
            .download_track(&track, album.as_ref().map(|a| &a.album), &settings, &token)
            .await;
        match result {
            Ok(result) => {
                let title = track.display_title();
                if let (true, Some(actual)) = (result.fallback_used, result.actual_quality) {
                    self.notify(DownloadNotice::QualityFallback {
                        title: title.clone(),
                        requested: settings.output_quality,
                        actual,
                    });
                }
                self.notify(DownloadNotice::Saved {
                    title,
                    file_name: result.file_name,
                    quality: result.actual_quality,
                });
                Ok(())
            }
            Err(e) => {
                self.handle_failure(CatalogItem::Track(Box::new(track)), album, settings, &e);
                job_result(e)
            }
        }
    }

    async fn run_album(
        &self,
        album_id: String,
        title: String,
        prefetched: Option<FetchedAlbum>,
        settings: DownloadSettings,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        let item = CatalogItem::Album {
            album_id: album_id.clone(),
            title: Some(title),
        };
        let fetched = match prefetched {
            Some(fetched) => fetched,
            None => match self.inner.orchestrator.fetch_album(&album_id).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    self.handle_failure(item, None, settings, &e);
                    return job_result(e);
                }
            },
        };

        let outcome = match self
            .inner
            .orchestrator
            .download_album(&fetched, &settings, &token)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.handle_failure(item, Some(fetched), settings, &e);
                return job_result(e);
            }
        };

        for failure in &outcome.failures {
            self.handle_failure(
                CatalogItem::Track(Box::new(failure.track.clone())),
                Some(fetched.clone()),
                settings.clone(),
                &failure.error,
            );
        }
        let fallbacks = outcome.results.iter().filter(|r| r.fallback_used);
        for result in fallbacks {
            if let Some(actual) = result.actual_quality {
                self.notify(DownloadNotice::QualityFallback {
                    title: result.file_name.clone(),
                    requested: settings.output_quality,
                    actual,
                });
            }
        }
        self.notify(DownloadNotice::AlbumSaved {
            title: fetched.album.display_title(),
            saved: outcome.results.len(),
            failed: outcome.failures.len(),
        });
        Ok(())
    }

    /// Classifies `error` and queues a retry item when the failure is retryable.
    fn handle_failure(
        &self,
        item: CatalogItem,
        album: Option<FetchedAlbum>,
        settings: DownloadSettings,
        error: &PipelineError,
    ) {
        let title = item.title();
        if error.is_cancelled() {
            info!("Download of \"{}\" cancelled", title);
            self.notify(DownloadNotice::Cancelled { title });
            return;
        }

        let Some(reason) = error.retry_reason() else {
            warn!("Download of \"{}\" failed: {}", title, error);
            self.notify(DownloadNotice::Failed {
                title,
                error: error.to_string(),
                attempts: None,
            });
            return;
        };

        let degraded = error.degraded_output();
        let auto_retry = reason.is_auto_retryable();
        let offer_save_anyway = reason == RetryReason::ShorterThanExpected && degraded.is_some();
        let retry_id = self.inner.retries.add_item(NewRetryItem {
            item,
            settings,
            album,
            reason,
            error: error.to_string(),
            auto_retry,
            degraded,
        });
        self.notify(DownloadNotice::RetryQueued {
            retry_id: retry_id.clone(),
            title,
            reason,
            error: error.to_string(),
            auto_retry,
            offer_save_anyway,
        });
        if auto_retry {
            self.schedule_auto_retry(retry_id);
        }
    }

    fn schedule_auto_retry(&self, retry_id: String) {
        self.inner.retry_loops.send_modify(|n| *n += 1);
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(service.inner.auto_retry_delay) => {}
                    _ = service.inner.root.cancelled() => break,
                }
                match service.retry(&retry_id).await {
                    RetryOutcome::Failed { .. } => continue,
                    RetryOutcome::AlreadyRetrying => continue,
                    _ => break,
                }
            }
            service.inner.retry_loops.send_modify(|n| *n = n.saturating_sub(1));
        });
    }

    /// Retries one item now, through the scheduler, and reports the outcome.
    pub async fn retry(&self, retry_id: &str) -> RetryOutcome {
        let Some(item) = self.inner.retries.get(retry_id) else {
            return RetryOutcome::NotFound;
        };
        let title = item.title();

        let (reply, outcome) = oneshot::channel();
        let service = self.clone();
        let id = retry_id.to_string();
        let job = Job::new(format!("Retry: {}", title), JobKind::Retry, move |token| async move {
            let outcome = service.inner.retries.retry_item(&id, &token).await;
            let _ = reply.send(outcome);
            Ok(())
        })
        .with_token(self.inner.root.child_token());
        self.inner.scheduler.submit(job);
        let outcome = outcome.await.unwrap_or(RetryOutcome::Cancelled);

        match &outcome {
            RetryOutcome::Succeeded => self.notify(DownloadNotice::RetrySucceeded {
                retry_id: retry_id.to_string(),
                title,
            }),
            RetryOutcome::Exhausted { error } => self.notify(DownloadNotice::Failed {
                title,
                error: error.clone(),
                attempts: Some((item.attempts + 1, item.max_attempts)),
            }),
            RetryOutcome::Cancelled => self.notify(DownloadNotice::Cancelled { title }),
            other => debug!("Retry of \"{}\": {:?}", title, other),
        }
        outcome
    }

    /// Retries every item with attempts left, one after another.
    pub async fn retry_all(&self) -> Vec<(String, RetryOutcome)> {
        let ids: Vec<String> = self
            .inner
            .retries
            .items()
            .into_iter()
            .filter(RetryItem::has_attempts_left)
            .map(|item| item.id)
            .collect();
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = self.retry(&id).await;
            outcomes.push((id, outcome));
        }
        outcomes
    }

    /// Persists the output held back by a failed duration check and drops the item.
    pub async fn save_anyway(&self, retry_id: &str) -> anyhow::Result<StoredFile> {
        let item = self
            .inner
            .retries
            .get(retry_id)
            .ok_or_else(|| anyhow!("retry item {} not found", retry_id))?;
        let degraded = item
            .degraded
            .clone()
            .ok_or_else(|| anyhow!("\"{}\" has no saved output", item.title()))?;

        let stored = self.inner.orchestrator.save_degraded(&degraded).await?;
        self.inner.retries.remove_item(retry_id);
        info!("Saved \"{}\" anyway as {}", item.title(), stored.relative_path);
        self.notify(DownloadNotice::Saved {
            title: item.title(),
            file_name: stored.relative_path.clone(),
            quality: None,
        });
        Ok(stored)
    }

    /// Resolves once no job is queued or running and no automatic retry is pending.
    pub async fn wait_until_settled(&self) {
        let mut loops = self.inner.retry_loops.subscribe();
        loop {
            self.inner.scheduler.wait_idle().await;
            let _ = loops.wait_for(|n| *n == 0).await;
            if self.inner.scheduler.is_idle() && *loops.borrow() == 0 {
                break;
            }
        }
    }

    /// Cancels every job and stops automatic retries.
    pub fn shutdown(&self) {
        info!("Shutting down download service");
        self.inner.root.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.root.is_cancelled()
    }
}

/// Cancellation settles a job quietly; anything else is reported to the scheduler.
fn job_result(error: PipelineError) -> anyhow::Result<()> {
    if error.is_cancelled() {
        Ok(())
    } else {
        Err(error.into())
    }
}
