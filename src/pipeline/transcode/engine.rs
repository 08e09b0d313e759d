//! The transcoding engine: a stateful resource with its own scratch filesystem.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transcoding engine is not loaded")]
    NotLoaded,

    #[error("transcoding engine unavailable: {0}")]
    Unavailable(String),

    #[error("invalid engine file name: {0:?}")]
    InvalidName(String),

    #[error("engine file not found: {0}")]
    FileNotFound(String),

    #[error("engine command failed ({code:?}): {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single, non-reentrant transcoding engine.
///
/// Every method takes `&mut self`: callers must hold exclusive access, which the
/// transcoding queue guarantees. File names are flat names inside the engine's
/// own filesystem, and command arguments refer to those names.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    fn is_loaded(&self) -> bool;

    async fn load(&mut self) -> Result<(), EngineError>;

    async fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), EngineError>;

    async fn read_file(&mut self, name: &str) -> Result<Vec<u8>, EngineError>;

    async fn delete_file(&mut self, name: &str) -> Result<(), EngineError>;

    async fn run(&mut self, args: &[String]) -> Result<(), EngineError>;
}

/// `ffmpeg` subprocess engine working inside a private scratch directory.
pub struct FfmpegEngine {
    binary: PathBuf,
    workdir: Option<TempDir>,
}

impl FfmpegEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            workdir: None,
        }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, EngineError> {
        let workdir = self.workdir.as_ref().ok_or(EngineError::NotLoaded)?;
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name == "."
            || name == ".."
        {
            return Err(EngineError::InvalidName(name.to_string()));
        }
        Ok(workdir.path().join(name))
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    fn is_loaded(&self) -> bool {
        self.workdir.is_some()
    }

    async fn load(&mut self) -> Result<(), EngineError> {
        if self.is_loaded() {
            return Ok(());
        }

        let status = Command::new(&self.binary)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| EngineError::Unavailable(format!("{:?}: {}", self.binary, e)))?;
        if !status.success() {
            return Err(EngineError::Unavailable(format!(
                "{:?} -version exited with {}",
                self.binary, status
            )));
        }

        let workdir = tempfile::Builder::new()
            .prefix("hifi-dl-engine-")
            .tempdir()?;
        info!(
            "Loaded transcoding engine {:?} (scratch dir {:?})",
            self.binary,
            workdir.path()
        );
        self.workdir = Some(workdir);
        Ok(())
    }

    async fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), EngineError> {
        let path = self.resolve(name)?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn read_file(&mut self, name: &str) -> Result<Vec<u8>, EngineError> {
        let path = self.resolve(name)?;
        match tokio::fs::read(path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::FileNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&mut self, name: &str) -> Result<(), EngineError> {
        let path = self.resolve(name)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::FileNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run(&mut self, args: &[String]) -> Result<(), EngineError> {
        let workdir = self.workdir.as_ref().ok_or(EngineError::NotLoaded)?;
        debug!("ffmpeg {}", args.join(" "));

        let output = Command::new(&self.binary)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(args)
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_operations_require_load() {
        let mut engine = FfmpegEngine::new("ffmpeg");
        assert!(!engine.is_loaded());
        assert!(matches!(
            engine.write_file("input.flac", b"x").await,
            Err(EngineError::NotLoaded)
        ));
        assert!(matches!(
            engine.run(&["-version".to_string()]).await,
            Err(EngineError::NotLoaded)
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let mut engine = FfmpegEngine::new("/nonexistent/bin/ffmpeg-that-does-not-exist");
        let result = engine.load().await;
        assert!(matches!(result, Err(EngineError::Unavailable(_))));
        assert!(!engine.is_loaded());
    }

    #[test]
    fn test_resolve_rejects_nested_names() {
        let engine = FfmpegEngine {
            binary: PathBuf::from("ffmpeg"),
            workdir: Some(TempDir::new().unwrap()),
        };
        assert!(engine.resolve("input_abc.flac").is_ok());
        assert!(matches!(
            engine.resolve("../escape.flac"),
            Err(EngineError::InvalidName(_))
        ));
        assert!(matches!(engine.resolve(""), Err(EngineError::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_scratch_files_round_trip() {
        let mut engine = FfmpegEngine {
            binary: PathBuf::from("ffmpeg"),
            workdir: Some(TempDir::new().unwrap()),
        };
        engine.write_file("meta.txt", b";FFMETADATA1\n").await.unwrap();
        assert_eq!(engine.read_file("meta.txt").await.unwrap(), b";FFMETADATA1\n");
        engine.delete_file("meta.txt").await.unwrap();
        assert!(matches!(
            engine.read_file("meta.txt").await,
            Err(EngineError::FileNotFound(_))
        ));
    }
}
