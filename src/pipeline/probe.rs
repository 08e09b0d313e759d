//! Decoded-duration probe used to validate finished files.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),

    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait AudioProbe: Send + Sync {
    /// Decoded duration of `bytes` in milliseconds. `extension` hints the container.
    async fn duration_ms(&self, bytes: &[u8], extension: &str) -> Result<u64, ProbeError>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    duration: Option<String>,
}

/// Parses `ffprobe -print_format json` output. Prefers the container duration and
/// falls back to the audio stream's.
fn parse_duration_ms(json: &[u8]) -> Result<u64, ProbeError> {
    let probe: FfprobeOutput = serde_json::from_slice(json)
        .map_err(|e| ProbeError::InvalidOutput(format!("JSON parse error: {}", e)))?;

    let audio_stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "audio")
        .ok_or_else(|| ProbeError::InvalidOutput("No audio stream found".to_string()))?;

    let duration_secs: f64 = probe
        .format
        .duration
        .as_ref()
        .or(audio_stream.duration.as_ref())
        .and_then(|d| d.parse().ok())
        .ok_or_else(|| ProbeError::InvalidOutput("No duration reported".to_string()))?;
    Ok((duration_secs.max(0.0) * 1000.0).round() as u64)
}

pub struct FfprobeProbe {
    binary: PathBuf,
}

impl FfprobeProbe {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl AudioProbe for FfprobeProbe {
    async fn duration_ms(&self, bytes: &[u8], extension: &str) -> Result<u64, ProbeError> {
        // Removed when `input` drops.
        let input = tempfile::Builder::new()
            .prefix("probe_")
            .suffix(&format!(".{}", extension))
            .tempfile()?
            .into_temp_path();
        tokio::fs::write(&input, bytes).await?;

        let output = Command::new(&self.binary)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(&input)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::ProbeFailed(stderr.to_string()));
        }
        parse_duration_ms(&output.stdout)
    }
}
