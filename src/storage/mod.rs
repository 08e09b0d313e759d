//! Durable storage for finished downloads.
//!
//! [`FileStore::persist_file`] is the only write path the pipeline uses. Files land
//! under `<root>/<artist folder>/<album folder>/<file name>`; empty folder components
//! are skipped so archives can be stored at the root.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Upper bound for a single stored file.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 720 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file too large: {size} bytes (max: {max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("invalid path component: {0:?}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Acknowledgement for a persisted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Path relative to the store root, `/` separated.
    pub relative_path: String,
    pub size: u64,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn persist_file(
        &self,
        artist_folder: &str,
        album_folder: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, StorageError>;
}

/// Stores files on the local filesystem.
pub struct LocalFileStore {
    root: PathBuf,
    max_file_size: u64,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// A component must be a single normal path segment.
fn validate_component(component: &str) -> Result<(), StorageError> {
    if component.contains('/') || component.contains('\\') {
        return Err(StorageError::InvalidPath(component.to_string()));
    }
    let mut components = Path::new(component).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(StorageError::InvalidPath(component.to_string())),
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn persist_file(
        &self,
        artist_folder: &str,
        album_folder: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, StorageError> {
        let size = bytes.len() as u64;
        if size > self.max_file_size {
            return Err(StorageError::TooLarge {
                size,
                max: self.max_file_size,
            });
        }

        let mut relative = Vec::new();
        for folder in [artist_folder, album_folder] {
            if folder.is_empty() {
                continue;
            }
            validate_component(folder)?;
            relative.push(folder);
        }
        validate_component(file_name)?;

        let mut dir = self.root.clone();
        for folder in &relative {
            dir.push(folder);
        }
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(file_name);
        tokio::fs::write(&path, bytes).await?;

        relative.push(file_name);
        let relative_path = relative.join("/");
        info!(
            "Saved {} ({:#})",
            relative_path,
            byte_unit::Byte::from(size)
        );
        Ok(StoredFile {
            relative_path,
            size,
        })
    }
}
