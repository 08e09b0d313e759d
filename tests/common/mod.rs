//! Common test infrastructure
//!
//! Wires the real pipeline to in-memory collaborators and a temporary downloads
//! directory. Tests should only import from this module.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestHarness, FakeCatalog};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let harness = TestHarness::new(FakeCatalog::new());
//!     let service = harness.service(Default::default(), std::time::Duration::from_millis(10));
//! }
//! ```

#![allow(dead_code)]

mod constants;
mod fakes;
mod fixtures;

pub use constants::*;
pub use fakes::{FakeCatalog, FakeHashFixer, FakeProbe, MemoryEngine};
pub use fixtures::{album, cover_png, fetched_album, payload, track};

use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

use hifi_dl::config::DownloadSettings;
use hifi_dl::pipeline::transcode::TranscodeQueue;
use hifi_dl::pipeline::{DownloadNotice, DownloadOrchestrator, DownloadService, ProgressTracker};
use hifi_dl::storage::LocalFileStore;

pub struct TestHarness {
    pub catalog: Arc<FakeCatalog>,
    pub probe: Arc<FakeProbe>,
    pub hash_fixer: Arc<FakeHashFixer>,
    pub engine_runs: Arc<AtomicUsize>,
    pub progress: ProgressTracker,
    pub orchestrator: Arc<DownloadOrchestrator>,
    downloads: TempDir,
}

impl TestHarness {
    /// Must be called from within a Tokio runtime.
    pub fn new(catalog: FakeCatalog) -> Self {
        let catalog = Arc::new(catalog);
        let probe = Arc::new(FakeProbe::new(LONG_DURATION_MS));
        let hash_fixer = Arc::new(FakeHashFixer::default());
        let engine_runs = Arc::new(AtomicUsize::new(0));
        let downloads = TempDir::new().expect("create downloads dir");
        let progress = ProgressTracker::new();

        let orchestrator = Arc::new(DownloadOrchestrator::new(
            catalog.clone(),
            Arc::new(TranscodeQueue::new(Box::new(MemoryEngine::new(
                engine_runs.clone(),
            )))),
            hash_fixer.clone(),
            probe.clone(),
            Arc::new(LocalFileStore::new(downloads.path())),
            progress.clone(),
        ));

        Self {
            catalog,
            probe,
            hash_fixer,
            engine_runs,
            progress,
            orchestrator,
            downloads,
        }
    }

    pub fn service(&self, settings: DownloadSettings, auto_retry_delay: Duration) -> DownloadService {
        DownloadService::new(self.orchestrator.clone(), settings, auto_retry_delay)
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.downloads.path().join(relative)
    }

    pub fn read(&self, relative: &str) -> Vec<u8> {
        std::fs::read(self.path(relative))
            .unwrap_or_else(|e| panic!("read {}: {}", relative, e))
    }

    /// Every file under the downloads dir, relative and `/` separated, sorted.
    pub fn saved_files(&self) -> Vec<String> {
        fn walk(dir: &std::path::Path, root: &std::path::Path, out: &mut Vec<String>) {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(&path, root, out);
                } else {
                    let relative = path.strip_prefix(root).unwrap();
                    out.push(
                        relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy().into_owned())
                            .collect::<Vec<_>>()
                            .join("/"),
                    );
                }
            }
        }
        let mut files = Vec::new();
        walk(self.downloads.path(), self.downloads.path(), &mut files);
        files.sort();
        files
    }
}

/// Receives notices until one matches `predicate`, failing after five seconds.
pub async fn wait_for_notice<F>(
    notices: &mut broadcast::Receiver<DownloadNotice>,
    mut predicate: F,
) -> DownloadNotice
where
    F: FnMut(&DownloadNotice) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let notice = notices.recv().await.expect("notice channel open");
            if predicate(&notice) {
                return notice;
            }
        }
    })
    .await
    .expect("timed out waiting for notice")
}

/// Zip entry names, sorted.
pub fn zip_entries(bytes: &[u8]) -> Vec<String> {
    let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).expect("valid zip");
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    names
}
