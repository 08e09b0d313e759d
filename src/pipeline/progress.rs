//! Hierarchical album → track progress.
//!
//! [`ProgressTracker`] is the single source of truth for download progress. Every
//! mutation recomputes the owning album's aggregate and then hands a snapshot of the
//! whole state to each subscriber.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error};

use crate::catalog::{Album, QualityTier, Track};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    Pending,
    Downloading,
    Processing,
    Completed,
    Failed,
}

impl TrackStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrackStatus::Completed | TrackStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlbumStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl AlbumStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AlbumStatus::Completed | AlbumStatus::Failed | AlbumStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackProgress {
    pub track_id: u64,
    pub title: String,
    /// 0 to 100.
    pub progress: u8,
    pub status: TrackStatus,
    pub error: Option<String>,
    pub actual_quality: Option<QualityTier>,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlbumProgress {
    pub album_id: String,
    pub title: String,
    pub artist: String,
    pub total_tracks: usize,
    pub completed_tracks: usize,
    pub failed_tracks: usize,
    pub tracks: HashMap<u64, TrackProgress>,
    /// Rounded mean of the track percentages.
    pub overall_progress: u8,
    pub status: AlbumStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AlbumProgress {
    fn recompute(&mut self) -> Option<AlbumStatus> {
        self.overall_progress = if self.tracks.is_empty() {
            0
        } else {
            let sum: f64 = self.tracks.values().map(|t| t.progress as f64).sum();
            (sum / self.tracks.len() as f64).round() as u8
        };

        if self.status == AlbumStatus::Cancelled {
            return None;
        }
        if self.completed_tracks + self.failed_tracks >= self.total_tracks {
            let status = if self.failed_tracks == 0 {
                AlbumStatus::Completed
            } else {
                AlbumStatus::Failed
            };
            self.status = status;
            if self.finished_at.is_none() {
                self.finished_at = Some(Utc::now());
                return Some(status);
            }
        } else {
            self.status = AlbumStatus::Downloading;
        }
        None
    }
}

/// Snapshot of everything the tracker knows.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ProgressState {
    pub albums: HashMap<String, AlbumProgress>,
    /// Albums not yet in a terminal state.
    pub active_downloads: usize,
    pub total_downloads: usize,
    pub completed_downloads: usize,
    pub failed_downloads: usize,
}

type Subscriber = Arc<dyn Fn(&ProgressState) + Send + Sync>;

struct TrackerInner {
    state: Mutex<ProgressState>,
    /// Bumped under the state lock; orders snapshots for delivery.
    version: AtomicU64,
    /// Last version handed to subscribers. Held while they run.
    delivered: Mutex<u64>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscriber_id: AtomicU64,
}

/// Handle returned by [`ProgressTracker::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    tracker: Weak<TrackerInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.tracker.upgrade() {
            lock(&inner.subscribers).remove(&self.id);
        }
    }
}

impl std::fmt::Debug for TrackerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerInner").finish_non_exhaustive()
    }
}

/// A panicking subscriber must not wedge the tracker.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Key used for single-track downloads tracked as a one-track album.
pub fn single_track_key(track_id: u64) -> String {
    format!("track-{}", track_id)
}

#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                state: Mutex::new(ProgressState::default()),
                version: AtomicU64::new(0),
                delivered: Mutex::new(0),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers `callback`; it receives a snapshot after every mutation, oldest
    /// first. A snapshot superseded before delivery is skipped. Callbacks must not
    /// mutate the tracker.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ProgressState) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.subscribers).insert(id, Arc::new(callback));
        Subscription {
            id,
            tracker: Arc::downgrade(&self.inner),
        }
    }

    /// Seeds progress for `album`, one pending entry per track. Re-initializing an
    /// album id replaces the previous entry.
    pub fn initialize_album(&self, album: &Album, tracks: &[Track]) {
        self.seed(
            album.id.clone(),
            album.display_title(),
            album.display_artists(),
            tracks,
        );
    }

    /// Seeds a one-track album keyed by [`single_track_key`] and returns the key.
    pub fn initialize_track(&self, track: &Track) -> String {
        let key = single_track_key(track.id);
        self.seed(
            key.clone(),
            track.display_title(),
            track.display_artists(),
            std::slice::from_ref(track),
        );
        key
    }

    fn seed(&self, album_id: String, title: String, artist: String, tracks: &[Track]) {
        let tracks: HashMap<u64, TrackProgress> = tracks
            .iter()
            .map(|t| {
                (
                    t.id,
                    TrackProgress {
                        track_id: t.id,
                        title: t.display_title(),
                        progress: 0,
                        status: TrackStatus::Pending,
                        error: None,
                        actual_quality: None,
                        fallback_used: false,
                    },
                )
            })
            .collect();
        let mut album = AlbumProgress {
            album_id: album_id.clone(),
            title,
            artist,
            total_tracks: tracks.len(),
            completed_tracks: 0,
            failed_tracks: 0,
            tracks,
            overall_progress: 0,
            status: AlbumStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
        };

        self.mutate(|state| {
            state.total_downloads += 1;
            if album.total_tracks == 0 {
                if let Some(status) = album.recompute() {
                    count_finished(state, status);
                }
            }
            state.albums.insert(album_id, album);
            true
        });
    }

    /// Sets a track's percentage, clamped to 0..=100. A terminal `status` is routed
    /// through [`complete_track`](Self::complete_track) / [`fail_track`](Self::fail_track).
    pub fn update_track_progress(
        &self,
        album_id: &str,
        track_id: u64,
        percent: f64,
        status: Option<TrackStatus>,
    ) {
        match status {
            Some(TrackStatus::Completed) => return self.complete_track(album_id, track_id, None, false),
            Some(TrackStatus::Failed) => return self.fail_track(album_id, track_id, "failed"),
            _ => {}
        }
        let percent = if percent.is_nan() {
            0
        } else {
            percent.clamp(0.0, 100.0).round() as u8
        };

        self.mutate_track(album_id, track_id, |track| {
            track.progress = percent;
            if let Some(status) = status {
                track.status = status;
            } else if track.status == TrackStatus::Pending {
                track.status = TrackStatus::Downloading;
            }
            None
        });
    }

    /// Marks a track completed. Repeated calls for a finished track are ignored.
    pub fn complete_track(
        &self,
        album_id: &str,
        track_id: u64,
        actual_quality: Option<QualityTier>,
        fallback_used: bool,
    ) {
        self.mutate_track(album_id, track_id, |track| {
            track.progress = 100;
            track.status = TrackStatus::Completed;
            track.actual_quality = actual_quality;
            track.fallback_used = fallback_used;
            Some(TrackStatus::Completed)
        });
    }

    /// Marks a track failed. Repeated calls for a finished track are ignored.
    pub fn fail_track(&self, album_id: &str, track_id: u64, error: &str) {
        let error = error.to_string();
        self.mutate_track(album_id, track_id, move |track| {
            track.status = TrackStatus::Failed;
            track.error = Some(error);
            Some(TrackStatus::Failed)
        });
    }

    /// Stamps an album as cancelled; later track updates are ignored.
    pub fn cancel_album(&self, album_id: &str) {
        self.mutate(|state| match state.albums.get_mut(album_id) {
            Some(album) if !album.status.is_terminal() => {
                album.status = AlbumStatus::Cancelled;
                album.finished_at = Some(Utc::now());
                true
            }
            _ => false,
        });
    }

    pub fn get_state(&self) -> ProgressState {
        lock(&self.inner.state).clone()
    }

    pub fn get_album_progress(&self, album_id: &str) -> Option<AlbumProgress> {
        lock(&self.inner.state).albums.get(album_id).cloned()
    }

    pub fn get_track_progress(&self, album_id: &str, track_id: u64) -> Option<TrackProgress> {
        lock(&self.inner.state)
            .albums
            .get(album_id)
            .and_then(|a| a.tracks.get(&track_id))
            .cloned()
    }

    /// Drops albums that completed successfully.
    pub fn clear_completed(&self) {
        self.mutate(|state| {
            let before = state.albums.len();
            state
                .albums
                .retain(|_, album| album.status != AlbumStatus::Completed);
            state.albums.len() != before
        });
    }

    pub fn clear(&self) {
        self.mutate(|state| {
            *state = ProgressState::default();
            true
        });
    }

    fn mutate_track<F>(&self, album_id: &str, track_id: u64, update: F)
    where
        F: FnOnce(&mut TrackProgress) -> Option<TrackStatus>,
    {
        self.mutate(|state| {
            let Some(album) = state.albums.get_mut(album_id) else {
                debug!("Progress update for unknown album {}", album_id);
                return false;
            };
            if album.status == AlbumStatus::Cancelled {
                return false;
            }
            let Some(track) = album.tracks.get_mut(&track_id) else {
                debug!("Progress update for unknown track {} in {}", track_id, album_id);
                return false;
            };
            if track.status.is_terminal() {
                return false;
            }

            match update(track) {
                Some(TrackStatus::Completed) => album.completed_tracks += 1,
                Some(TrackStatus::Failed) => album.failed_tracks += 1,
                _ => {}
            }
            if let Some(finished) = album.recompute() {
                count_finished(state, finished);
            }
            true
        });
    }

    /// Applies `mutation` and, when it reports a change, notifies subscribers.
    fn mutate<F>(&self, mutation: F)
    where
        F: FnOnce(&mut ProgressState) -> bool,
    {
        let (version, snapshot) = {
            let mut state = lock(&self.inner.state);
            if !mutation(&mut state) {
                return;
            }
            state.active_downloads = state
                .albums
                .values()
                .filter(|a| !a.status.is_terminal())
                .count();
            let version = self.inner.version.fetch_add(1, Ordering::SeqCst) + 1;
            (version, state.clone())
        };
        self.notify(version, &snapshot);
    }

    fn notify(&self, version: u64, snapshot: &ProgressState) {
        let mut delivered = lock(&self.inner.delivered);
        if version < *delivered {
            debug!("Skipping superseded progress snapshot {}", version);
            return;
        }
        *delivered = version;
        let subscribers: Vec<Subscriber> = lock(&self.inner.subscribers).values().cloned().collect();
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(snapshot))).is_err() {
                error!("Progress subscriber panicked; continuing");
            }
        }
    }
}

fn count_finished(state: &mut ProgressState, status: AlbumStatus) {
    match status {
        AlbumStatus::Completed => state.completed_downloads += 1,
        AlbumStatus::Failed => state.failed_downloads += 1,
        _ => {}
    }
}
