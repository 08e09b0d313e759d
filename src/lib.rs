//! hifi-dl library
//!
//! Download pipeline for a remote music catalog: bounded job scheduling, quality
//! fallback, a serialized transcoding queue, hierarchical progress tracking and a
//! retry queue, plus the catalog and storage collaborators the binary wires together.

pub mod catalog;
pub mod config;
pub mod pipeline;
pub mod storage;

// Re-export commonly used types for convenience
pub use catalog::{CatalogClient, CatalogError, HttpCatalogClient};
pub use config::{AppConfig, CliConfig, DownloadSettings, FileConfig};
pub use pipeline::{DownloadNotice, DownloadOrchestrator, DownloadService, JobScheduler, ProgressTracker, RetryQueue};
pub use storage::{FileStore, LocalFileStore, StorageError, StoredFile};
