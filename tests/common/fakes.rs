//! In-memory collaborators for the download pipeline.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use hifi_dl::catalog::{
    Album, CatalogClient, CatalogError, FetchedAlbum, QualityTier, ReleasePage, ReleaseType,
    Track,
};
use hifi_dl::pipeline::transcode::{EngineError, TranscodeEngine};
use hifi_dl::pipeline::{AudioProbe, HashFixer, Md5FixError, ProbeError};

use super::constants::{CDN_BASE, IMAGE_BASE};

/// Catalog backed by maps. Streams are keyed by track and tier.
#[derive(Default)]
pub struct FakeCatalog {
    tracks: Mutex<HashMap<u64, Track>>,
    albums: Mutex<HashMap<String, FetchedAlbum>>,
    releases: Mutex<HashMap<(String, ReleaseType), Vec<Album>>>,
    streams: Mutex<HashMap<(u64, QualityTier), Vec<u8>>>,
    cover: Mutex<Vec<u8>>,
    /// Resolve calls that fail with 503 before the catalog starts answering.
    failing_resolves: AtomicUsize,
    /// Stream transfers block until cancelled.
    hold_streams: AtomicBool,
    pub resolved: Mutex<Vec<(u64, QualityTier)>>,
    pub held: AtomicUsize,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_track(self, track: Track) -> Self {
        self.tracks.lock().unwrap().insert(track.id, track);
        self
    }

    /// Registers the album and its tracks.
    pub fn with_album(self, fetched: FetchedAlbum) -> Self {
        for track in fetched.streamable_tracks() {
            self.tracks.lock().unwrap().insert(track.id, track);
        }
        self.albums
            .lock()
            .unwrap()
            .insert(fetched.album.id.clone(), fetched);
        self
    }

    pub fn with_releases(self, artist_id: &str, release_type: ReleaseType, albums: Vec<Album>) -> Self {
        self.releases
            .lock()
            .unwrap()
            .insert((artist_id.to_string(), release_type), albums);
        self
    }

    pub fn with_stream(self, track_id: u64, tier: QualityTier, bytes: Vec<u8>) -> Self {
        self.streams.lock().unwrap().insert((track_id, tier), bytes);
        self
    }

    pub fn with_cover(self, bytes: Vec<u8>) -> Self {
        *self.cover.lock().unwrap() = bytes;
        self
    }

    pub fn fail_first_resolves(self, count: usize) -> Self {
        self.failing_resolves.store(count, Ordering::SeqCst);
        self
    }

    pub fn hold_streams(self) -> Self {
        self.hold_streams.store(true, Ordering::SeqCst);
        self
    }

    pub fn resolved_tiers(&self, track_id: u64) -> Vec<QualityTier> {
        self.resolved
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == track_id)
            .map(|(_, tier)| *tier)
            .collect()
    }

    fn stream_for(&self, url: &str) -> Option<Vec<u8>> {
        let rest = url.strip_prefix(CDN_BASE)?;
        let (track, tier) = rest.split_once('/')?;
        let key: (u64, QualityTier) = (track.parse().ok()?, tier.parse().ok()?);
        self.streams.lock().unwrap().get(&key).cloned()
    }
}

#[async_trait]
impl CatalogClient for FakeCatalog {
    async fn resolve_stream_url(
        &self,
        track_id: u64,
        tier: QualityTier,
    ) -> Result<String, CatalogError> {
        self.resolved.lock().unwrap().push((track_id, tier));
        let failing = self
            .failing_resolves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(CatalogError::from_status(503, "upstream unavailable"));
        }
        if self.streams.lock().unwrap().contains_key(&(track_id, tier)) {
            Ok(format!("{}{}/{}", CDN_BASE, track_id, tier))
        } else {
            Err(CatalogError::from_status(404, "format not available"))
        }
    }

    async fn fetch_track(&self, track_id: u64) -> Result<Track, CatalogError> {
        self.tracks
            .lock()
            .unwrap()
            .get(&track_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(format!("track {}", track_id)))
    }

    async fn fetch_album(&self, album_id: &str) -> Result<FetchedAlbum, CatalogError> {
        self.albums
            .lock()
            .unwrap()
            .get(album_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(format!("album {}", album_id)))
    }

    async fn fetch_artist_releases(
        &self,
        artist_id: &str,
        release_type: ReleaseType,
        offset: u32,
        limit: u32,
    ) -> Result<ReleasePage, CatalogError> {
        let all = self
            .releases
            .lock()
            .unwrap()
            .get(&(artist_id.to_string(), release_type))
            .cloned()
            .unwrap_or_default();
        let items: Vec<Album> = all
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(ReleasePage {
            has_more: (offset + limit) < all.len() as u32,
            items,
        })
    }

    async fn fetch_bytes(
        &self,
        url: &str,
        cancel: &CancellationToken,
        progress: &(dyn Fn(u64, Option<u64>) + Send + Sync),
    ) -> Result<Vec<u8>, CatalogError> {
        if url.starts_with(IMAGE_BASE) {
            return Ok(self.cover.lock().unwrap().clone());
        }
        let bytes = self
            .stream_for(url)
            .ok_or_else(|| CatalogError::NotFound(url.to_string()))?;
        let total = bytes.len() as u64;
        progress(total / 2, Some(total));

        if self.hold_streams.load(Ordering::SeqCst) {
            self.held.fetch_add(1, Ordering::SeqCst);
            cancel.cancelled().await;
            return Err(CatalogError::Cancelled);
        }
        if cancel.is_cancelled() {
            return Err(CatalogError::Cancelled);
        }
        progress(total, Some(total));
        Ok(bytes)
    }
}

/// Engine with an in-memory filesystem. Every command copies its first input to its
/// last argument.
pub struct MemoryEngine {
    loaded: bool,
    files: HashMap<String, Vec<u8>>,
    runs: Arc<AtomicUsize>,
}

impl MemoryEngine {
    pub fn new(runs: Arc<AtomicUsize>) -> Self {
        Self {
            loaded: false,
            files: HashMap::new(),
            runs,
        }
    }
}

#[async_trait]
impl TranscodeEngine for MemoryEngine {
    fn is_loaded(&self) -> bool {
        self.loaded
    }

    async fn load(&mut self) -> Result<(), EngineError> {
        self.loaded = true;
        Ok(())
    }

    async fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), EngineError> {
        self.files.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn read_file(&mut self, name: &str) -> Result<Vec<u8>, EngineError> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::FileNotFound(name.to_string()))
    }

    async fn delete_file(&mut self, name: &str) -> Result<(), EngineError> {
        self.files.remove(name);
        Ok(())
    }

    async fn run(&mut self, args: &[String]) -> Result<(), EngineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let input = args
            .iter()
            .position(|a| a == "-i")
            .and_then(|i| args.get(i + 1))
            .ok_or_else(|| EngineError::Unavailable("no input".to_string()))?;
        let output = args
            .last()
            .ok_or_else(|| EngineError::Unavailable("no output".to_string()))?;
        let data = self
            .files
            .get(input)
            .cloned()
            .ok_or_else(|| EngineError::FileNotFound(input.clone()))?;
        self.files.insert(output.clone(), data);
        Ok(())
    }
}

/// Reports a fixed duration per payload, and `default_ms` for anything else.
pub struct FakeProbe {
    durations: Mutex<HashMap<Vec<u8>, u64>>,
    default_ms: u64,
}

impl FakeProbe {
    pub fn new(default_ms: u64) -> Self {
        Self {
            durations: Mutex::new(HashMap::new()),
            default_ms,
        }
    }

    pub fn set_duration(&self, payload: &[u8], ms: u64) {
        self.durations.lock().unwrap().insert(payload.to_vec(), ms);
    }
}

#[async_trait]
impl AudioProbe for FakeProbe {
    async fn duration_ms(&self, bytes: &[u8], _extension: &str) -> Result<u64, ProbeError> {
        Ok(self
            .durations
            .lock()
            .unwrap()
            .get(bytes)
            .copied()
            .unwrap_or(self.default_ms))
    }
}

/// Returns its input unchanged and counts calls.
#[derive(Default)]
pub struct FakeHashFixer {
    pub calls: AtomicUsize,
}

#[async_trait]
impl HashFixer for FakeHashFixer {
    async fn fix(
        &self,
        input: &[u8],
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<Vec<u8>, Md5FixError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        on_progress(50);
        on_progress(100);
        Ok(input.to_vec())
    }
}
