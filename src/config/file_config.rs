use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub catalog_url: Option<String>,
    pub downloads_dir: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub auto_retry_delay_ms: Option<u64>,

    // External tools
    pub ffmpeg_path: Option<String>,
    pub ffprobe_path: Option<String>,
    pub flac_path: Option<String>,

    pub download: Option<DownloadConfig>,
}

/// `[download]` table.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DownloadConfig {
    /// FLAC, WAV, ALAC, MP3, AAC or OPUS.
    pub output_codec: Option<String>,
    /// 27, 7, 6 or 5.
    pub output_quality: Option<u32>,
    pub bitrate: Option<u32>,
    pub apply_metadata: Option<bool>,
    pub fix_md5: Option<bool>,
    pub create_zip: Option<bool>,
    pub raw_download: Option<bool>,
    pub max_concurrent_downloads: Option<usize>,
    pub album_art_size: Option<u32>,
    pub album_art_quality: Option<f32>,
    pub zip_name: Option<String>,
    pub track_name: Option<String>,
    pub max_file_size: Option<u64>,
    pub duration_tolerance_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
