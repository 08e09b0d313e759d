//! Per-item download pipeline.
//!
//! fetch (with quality fallback) → size check → transcode/tag → hash fix → duration
//! check → package → persist, reporting into the progress tracker along the way.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{DegradedOutput, PipelineError};
use super::md5_fix::HashFixer;
use super::naming::{
    album_folder, artist_folder, track_file_name, unique_name, zip_file_name, TemplateFields,
};
use super::packaging::{build_zip, resize_cover_art, ArchiveEntry};
use super::probe::AudioProbe;
use super::progress::{ProgressTracker, TrackStatus};
use super::quality::{QualityAttempt, QualityFallbackEngine};
use super::retry::RetryItem;
use super::transcode::{OutputCodec, SourceFormat, TrackTags, TranscodeOperation, TranscodeQueue};
use crate::catalog::{
    Album, ArtistRef, CatalogClient, CatalogItem, FetchedAlbum, QualityTier, ReleaseType, Track,
};
use crate::config::DownloadSettings;
use crate::storage::{FileStore, StoredFile};

/// Page size used when listing an artist's releases.
pub const RELEASES_PAGE_SIZE: u32 = 20;

const COVER_FILE_NAME: &str = "cover.jpg";

/// Outcome of one track's pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadResult {
    pub success: bool,
    pub file_name: String,
    pub actual_quality: Option<QualityTier>,
    pub fallback_used: bool,
    pub file_size: u64,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// A track that made it through processing and is ready to be packaged.
#[derive(Debug)]
pub struct ProcessedTrack {
    pub track: Track,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub actual_quality: QualityTier,
    pub fallback_used: bool,
    pub attempts: Vec<QualityAttempt>,
    pub elapsed: Duration,
}

impl ProcessedTrack {
    fn result(&self) -> DownloadResult {
        DownloadResult {
            success: true,
            file_name: self.file_name.clone(),
            actual_quality: Some(self.actual_quality),
            fallback_used: self.fallback_used,
            file_size: self.bytes.len() as u64,
            elapsed: self.elapsed,
            error: None,
        }
    }
}

#[derive(Debug)]
pub struct TrackFailure {
    pub track: Track,
    pub error: PipelineError,
}

/// What an album download produced. Failed tracks do not fail the album.
#[derive(Debug)]
pub struct AlbumOutcome {
    pub album: FetchedAlbum,
    pub results: Vec<DownloadResult>,
    pub failures: Vec<TrackFailure>,
    pub saved: Vec<StoredFile>,
}

pub struct DownloadOrchestrator {
    catalog: Arc<dyn CatalogClient>,
    fetcher: QualityFallbackEngine,
    transcoder: Arc<TranscodeQueue>,
    hash_fixer: Arc<dyn HashFixer>,
    probe: Arc<dyn AudioProbe>,
    store: Arc<dyn FileStore>,
    progress: ProgressTracker,
}

impl DownloadOrchestrator {
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        transcoder: Arc<TranscodeQueue>,
        hash_fixer: Arc<dyn HashFixer>,
        probe: Arc<dyn AudioProbe>,
        store: Arc<dyn FileStore>,
        progress: ProgressTracker,
    ) -> Self {
        Self {
            fetcher: QualityFallbackEngine::new(catalog.clone()),
            catalog,
            transcoder,
            hash_fixer,
            probe,
            store,
            progress,
        }
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub async fn fetch_album(&self, album_id: &str) -> Result<FetchedAlbum, PipelineError> {
        Ok(self.catalog.fetch_album(album_id).await?)
    }

    /// Every release of `artist_id`, of one type or of all types, without duplicates.
    pub async fn artist_releases(
        &self,
        artist_id: &str,
        release_type: Option<ReleaseType>,
    ) -> Result<Vec<Album>, PipelineError> {
        let types = match release_type {
            Some(release_type) => vec![release_type],
            None => ReleaseType::ALL.to_vec(),
        };

        let mut seen = HashSet::new();
        let mut releases = Vec::new();
        for release_type in types {
            let mut offset = 0;
            loop {
                let page = self
                    .catalog
                    .fetch_artist_releases(artist_id, release_type, offset, RELEASES_PAGE_SIZE)
                    .await?;
                let fetched = page.items.len() as u32;
                for album in page.items {
                    if seen.insert(album.id.clone()) {
                        releases.push(album);
                    }
                }
                if !page.has_more || fetched == 0 {
                    break;
                }
                offset += RELEASES_PAGE_SIZE;
            }
        }
        debug!("Artist {} has {} releases", artist_id, releases.len());
        Ok(releases)
    }

    /// Downloads one track as a one-track album. `album` supplies the release context
    /// when the track payload lacks it.
    pub async fn download_track(
        &self,
        track: &Track,
        album: Option<&Album>,
        settings: &DownloadSettings,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult, PipelineError> {
        let key = self.progress.initialize_track(track);
        let result = self
            .download_track_inner(track, album, settings, cancel, &key)
            .await;
        match &result {
            Ok(_) => {}
            Err(e) if e.is_cancelled() => self.progress.cancel_album(&key),
            Err(e) => self.progress.fail_track(&key, track.id, &e.to_string()),
        }
        result
    }

    async fn download_track_inner(
        &self,
        track: &Track,
        album: Option<&Album>,
        settings: &DownloadSettings,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<DownloadResult, PipelineError> {
        let album = match (album, &track.album) {
            (Some(album), _) => album.clone(),
            (None, Some(album)) => (**album).clone(),
            (None, None) => self.resolve_track_album(track).await?,
        };

        let cover = if settings.apply_metadata || settings.raw_download || settings.create_zip {
            self.fetch_cover(&album, settings, cancel).await
        } else {
            None
        };

        let processed = self
            .process_track(track, &album, settings, cover.clone(), key, cancel)
            .await?;

        let stored = if settings.create_zip {
            let mut entries = vec![ArchiveEntry::new(
                archive_path(&album, &processed.file_name),
                processed.bytes.clone(),
            )];
            if let Some(cover) = &cover {
                entries.push(ArchiveEntry::new(
                    archive_path(&album, COVER_FILE_NAME),
                    cover.to_vec(),
                ));
            }
            let archive = build_zip(&entries)?;
            let name = zip_file_name(&settings.zip_name, &TemplateFields::for_track(track, &album));
            self.check_size(archive.len(), settings)?;
            self.store.persist_file("", "", &name, &archive).await?
        } else {
            self.store
                .persist_file(
                    &artist_folder(&album),
                    &album_folder(&album),
                    &processed.file_name,
                    &processed.bytes,
                )
                .await?
        };

        self.progress.complete_track(
            key,
            track.id,
            Some(processed.actual_quality),
            processed.fallback_used,
        );
        info!(
            "Downloaded \"{}\" as {} at quality {}",
            track.display_title(),
            stored.relative_path,
            processed.actual_quality
        );

        let mut result = processed.result();
        result.file_name = stored.relative_path;
        result.file_size = stored.size;
        Ok(result)
    }

    /// Album context for a standalone track whose payload came without one.
    async fn resolve_track_album(&self, track: &Track) -> Result<Album, PipelineError> {
        let full = self.catalog.fetch_track(track.id).await?;
        Ok(match full.album {
            Some(album) => *album,
            None => Album {
                id: format!("track-{}", track.id),
                title: track.display_title(),
                artist: track.performer.clone().or_else(|| {
                    Some(ArtistRef {
                        id: 0,
                        name: track.display_artists(),
                    })
                }),
                ..Default::default()
            },
        })
    }

    /// Downloads every streamable track of `fetched` in order, then packages them.
    pub async fn download_album(
        &self,
        fetched: &FetchedAlbum,
        settings: &DownloadSettings,
        cancel: &CancellationToken,
    ) -> Result<AlbumOutcome, PipelineError> {
        let album = &fetched.album;
        let tracks = fetched.streamable_tracks();
        if tracks.is_empty() {
            return Err(PipelineError::NotStreamable(album.display_title()));
        }

        let key = album.id.clone();
        self.progress.initialize_album(album, &tracks);
        info!(
            "Downloading album \"{}\" by {} ({} tracks)",
            album.display_title(),
            album.display_artists(),
            tracks.len()
        );

        let cover = self.fetch_cover(album, settings, cancel).await;
        let mut outcome = AlbumOutcome {
            album: fetched.clone(),
            results: Vec::new(),
            failures: Vec::new(),
            saved: Vec::new(),
        };
        let mut processed_tracks = Vec::new();

        for track in tracks {
            if cancel.is_cancelled() {
                self.progress.cancel_album(&key);
                return Err(PipelineError::Cancelled);
            }
            match self
                .process_track(&track, album, settings, cover.clone(), &key, cancel)
                .await
            {
                Ok(processed) if settings.create_zip => processed_tracks.push(processed),
                Ok(processed) => match self.persist_processed(album, &processed).await {
                    Ok(stored) => {
                        self.progress.complete_track(
                            &key,
                            track.id,
                            Some(processed.actual_quality),
                            processed.fallback_used,
                        );
                        outcome.results.push(processed.result());
                        outcome.saved.push(stored);
                    }
                    Err(error) => {
                        self.progress.fail_track(&key, track.id, &error.to_string());
                        outcome.failures.push(TrackFailure { track, error });
                    }
                },
                Err(e) if e.is_cancelled() => {
                    self.progress.cancel_album(&key);
                    return Err(PipelineError::Cancelled);
                }
                Err(error) => {
                    warn!(
                        "Track \"{}\" of \"{}\" failed: {}",
                        track.display_title(),
                        album.display_title(),
                        error
                    );
                    self.progress.fail_track(&key, track.id, &error.to_string());
                    outcome.failures.push(TrackFailure { track, error });
                }
            }
        }

        if settings.create_zip {
            if !processed_tracks.is_empty() {
                match self
                    .persist_archive(album, &processed_tracks, cover.as_deref(), settings)
                    .await
                {
                    Ok(stored) => {
                        for processed in &processed_tracks {
                            self.progress.complete_track(
                                &key,
                                processed.track.id,
                                Some(processed.actual_quality),
                                processed.fallback_used,
                            );
                            outcome.results.push(processed.result());
                        }
                        outcome.saved.push(stored);
                    }
                    Err(e) => {
                        for processed in &processed_tracks {
                            self.progress.fail_track(&key, processed.track.id, &e.to_string());
                        }
                        return Err(e);
                    }
                }
            }
        } else if let Some(cover) = &cover {
            if !outcome.saved.is_empty() {
                match self
                    .store
                    .persist_file(
                        &artist_folder(album),
                        &album_folder(album),
                        COVER_FILE_NAME,
                        cover,
                    )
                    .await
                {
                    Ok(stored) => outcome.saved.push(stored),
                    Err(e) => warn!("Cover art for \"{}\" not saved: {}", album.title, e),
                }
            }
        }

        info!(
            "Album \"{}\" finished: {} saved, {} failed",
            album.display_title(),
            outcome.results.len(),
            outcome.failures.len()
        );
        Ok(outcome)
    }

    /// Runs a stored retry item again.
    pub async fn rerun(
        &self,
        item: &RetryItem,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        match &item.item {
            CatalogItem::Track(track) => {
                let album = item.album.as_ref().map(|fetched| &fetched.album);
                self.download_track(track, album, &item.settings, cancel)
                    .await
                    .map(|_| ())
            }
            CatalogItem::Album { album_id, .. } => {
                let fetched = match &item.album {
                    Some(fetched) => fetched.clone(),
                    None => self.fetch_album(album_id).await?,
                };
                let outcome = self.download_album(&fetched, &item.settings, cancel).await?;
                if outcome.failures.is_empty() {
                    return Ok(());
                }
                Err(PipelineError::AlbumIncomplete {
                    failures: outcome
                        .failures
                        .into_iter()
                        .map(|failure| (failure.track.display_title(), failure.error))
                        .collect(),
                })
            }
        }
    }

    /// Persists a file that was held back by a failed duration check.
    pub async fn save_degraded(&self, output: &DegradedOutput) -> Result<StoredFile, PipelineError> {
        Ok(self
            .store
            .persist_file(
                &output.artist_folder,
                &output.album_folder,
                &output.file_name,
                &output.bytes,
            )
            .await?)
    }

    async fn persist_processed(
        &self,
        album: &Album,
        processed: &ProcessedTrack,
    ) -> Result<StoredFile, PipelineError> {
        Ok(self
            .store
            .persist_file(
                &artist_folder(album),
                &album_folder(album),
                &processed.file_name,
                &processed.bytes,
            )
            .await?)
    }

    async fn persist_archive(
        &self,
        album: &Album,
        processed: &[ProcessedTrack],
        cover: Option<&Vec<u8>>,
        settings: &DownloadSettings,
    ) -> Result<StoredFile, PipelineError> {
        let mut taken = HashSet::new();
        let mut entries: Vec<ArchiveEntry> = processed
            .iter()
            .map(|p| {
                let name = unique_name(&p.file_name, &mut taken);
                ArchiveEntry::new(archive_path(album, &name), p.bytes.clone())
            })
            .collect();
        if let Some(cover) = cover {
            let name = unique_name(COVER_FILE_NAME, &mut taken);
            entries.push(ArchiveEntry::new(archive_path(album, &name), cover.clone()));
        }

        let archive = build_zip(&entries)?;
        self.check_size(archive.len(), settings)?;
        let name = zip_file_name(&settings.zip_name, &TemplateFields::for_album(album));
        Ok(self.store.persist_file("", "", &name, &archive).await?)
    }

    fn check_size(&self, size: usize, settings: &DownloadSettings) -> Result<(), PipelineError> {
        let size = size as u64;
        if size > settings.max_file_size {
            return Err(PipelineError::TooLarge {
                size,
                max: settings.max_file_size,
            });
        }
        Ok(())
    }

    /// Full resolution cover art, resized and recompressed. Failures mean no art.
    async fn fetch_cover(
        &self,
        album: &Album,
        settings: &DownloadSettings,
        cancel: &CancellationToken,
    ) -> Option<Arc<Vec<u8>>> {
        let url = album.full_res_image_url()?;
        let raw = match self.catalog.fetch_bytes(&url, cancel, &|_, _| {}).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cover art for \"{}\" unavailable: {}", album.title, e);
                return None;
            }
        };

        let size = settings.album_art_size;
        let quality = settings.album_art_quality;
        match tokio::task::spawn_blocking(move || resize_cover_art(&raw, size, quality)).await {
            Ok(Ok(art)) => Some(Arc::new(art)),
            Ok(Err(e)) => {
                warn!("Cover art for \"{}\" not usable: {}", album.title, e);
                None
            }
            Err(e) => {
                warn!("Cover art resize task failed: {}", e);
                None
            }
        }
    }

    /// Fetches and processes one track without persisting it.
    pub async fn process_track(
        &self,
        track: &Track,
        album: &Album,
        settings: &DownloadSettings,
        cover: Option<Arc<Vec<u8>>>,
        progress_key: &str,
        cancel: &CancellationToken,
    ) -> Result<ProcessedTrack, PipelineError> {
        if !track.streamable {
            return Err(PipelineError::NotStreamable(track.display_title()));
        }
        let started = Instant::now();
        let progress = &self.progress;
        progress.update_track_progress(progress_key, track.id, 0.0, Some(TrackStatus::Downloading));

        // The download phase maps onto 0..80 of the track's progress.
        let on_progress = |percent: u8| {
            progress.update_track_progress(progress_key, track.id, percent as f64 * 0.8, None);
        };
        let fetched = self
            .fetcher
            .fetch(
                track,
                settings.output_quality,
                &settings.fallback_tiers(),
                cancel,
                &on_progress,
            )
            .await?;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        self.check_size(fetched.buffer.len(), settings)?;

        progress.update_track_progress(progress_key, track.id, 85.0, Some(TrackStatus::Processing));
        let codec = settings.effective_codec(fetched.actual_quality);
        let mut operation = TranscodeOperation::new(
            fetched.buffer,
            SourceFormat::for_tier(fetched.actual_quality),
            codec,
            cancel.clone(),
        );
        if let Some(bitrate) = settings.bitrate_for(codec) {
            operation = operation.with_bitrate(bitrate);
        }
        if settings.apply_metadata || settings.raw_download {
            operation = operation.with_tags(TrackTags::new(track, album));
            if let Some(cover) = cover {
                operation = operation.with_cover_art(cover);
            }
        }
        let mut output = self.transcoder.enqueue(operation).await?;

        if codec == OutputCodec::Flac && settings.fix_md5 && !settings.raw_download {
            // 85..95 while the hash is fixed
            let on_fix = |percent: u8| {
                progress.update_track_progress(
                    progress_key,
                    track.id,
                    85.0 + percent as f64 * 0.1,
                    None,
                );
            };
            output = self.hash_fixer.fix(&output, &on_fix).await?;
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let file_name = track_file_name(&settings.track_name, track, album, codec.extension());
        let expected_ms = track.duration * 1000;
        if expected_ms > 0 {
            let actual_ms = self.probe.duration_ms(&output, codec.extension()).await?;
            if actual_ms + settings.duration_tolerance_ms < expected_ms {
                warn!(
                    "\"{}\" decoded to {}ms, expected {}ms",
                    track.display_title(),
                    actual_ms,
                    expected_ms
                );
                return Err(PipelineError::ShorterThanExpected {
                    expected_ms,
                    actual_ms,
                    output: Arc::new(DegradedOutput {
                        artist_folder: artist_folder(album),
                        album_folder: album_folder(album),
                        file_name,
                        bytes: output,
                    }),
                });
            }
        }
        self.check_size(output.len(), settings)?;

        progress.update_track_progress(progress_key, track.id, 95.0, None);
        Ok(ProcessedTrack {
            track: track.clone(),
            file_name,
            bytes: output,
            actual_quality: fetched.actual_quality,
            fallback_used: fetched.fallback_used,
            attempts: fetched.attempts,
            elapsed: started.elapsed(),
        })
    }
}

fn archive_path(album: &Album, file_name: &str) -> String {
    format!("{}/{}/{}", artist_folder(album), album_folder(album), file_name)
}
