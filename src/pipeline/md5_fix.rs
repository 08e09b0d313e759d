//! FLAC stream hash repair.
//!
//! Re-encoding through the reference `flac` encoder rewrites the STREAMINFO MD5
//! signature. This runs outside the transcoding queue: it needs no shared engine.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Md5FixError {
    #[error("flac encoder failed ({code:?}): {stderr}")]
    EncoderFailed { code: Option<i32>, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait HashFixer: Send + Sync {
    /// Returns `input` re-encoded with a correct hash. `on_progress` receives 0..=100.
    async fn fix(
        &self,
        input: &[u8],
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<Vec<u8>, Md5FixError>;
}

pub struct FlacHashFixer {
    binary: PathBuf,
}

impl FlacHashFixer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

/// Extracts the last `NN% complete` figure from an encoder status chunk.
fn parse_percent(chunk: &str) -> Option<u8> {
    chunk
        .split(['\r', '\n'])
        .filter_map(|line| {
            let idx = line.find("% complete")?;
            let digits: String = line[..idx]
                .chars()
                .rev()
                .take_while(|c| c.is_ascii_digit())
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            digits.parse::<u8>().ok()
        })
        .last()
        .map(|p| p.min(100))
}

#[async_trait]
impl HashFixer for FlacHashFixer {
    async fn fix(
        &self,
        input: &[u8],
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<Vec<u8>, Md5FixError> {
        let workdir = tempfile::Builder::new().prefix("flac-fix-").tempdir()?;
        let input_path = workdir.path().join("input.flac");
        let output_path = workdir.path().join("output.flac");
        tokio::fs::write(&input_path, input).await?;

        on_progress(0);
        let mut child = Command::new(&self.binary)
            .arg("--force")
            .arg("-o")
            .arg(&output_path)
            .arg(&input_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stderr_log = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            let mut buf = [0u8; 1024];
            let mut last = 0u8;
            loop {
                let n = stderr.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                let chunk = String::from_utf8_lossy(&buf[..n]);
                if let Some(percent) = parse_percent(&chunk) {
                    if percent > last {
                        last = percent;
                        on_progress(percent);
                    }
                }
                stderr_log.push_str(&chunk);
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(Md5FixError::EncoderFailed {
                code: status.code(),
                stderr: stderr_log.trim().to_string(),
            });
        }

        let fixed = tokio::fs::read(&output_path).await?;
        debug!(
            "Hash fix re-encoded {} bytes into {} bytes",
            input.len(),
            fixed.len()
        );
        on_progress(100);
        Ok(fixed)
    }
}
