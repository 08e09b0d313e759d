mod file_config;

pub use file_config::{DownloadConfig, FileConfig};

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::catalog::QualityTier;
use crate::pipeline::transcode::OutputCodec;
use crate::storage::DEFAULT_MAX_FILE_SIZE;

pub const MIN_BITRATE: u32 = 24;
pub const MAX_BITRATE: u32 = 320;
pub const MIN_ALBUM_ART_SIZE: u32 = 100;
pub const MAX_ALBUM_ART_SIZE: u32 = 3600;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub catalog_url: Option<String>,
    pub downloads_dir: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub output_codec: Option<OutputCodec>,
    pub output_quality: Option<QualityTier>,
    pub bitrate: Option<u32>,
    pub max_concurrent_downloads: Option<usize>,
    pub create_zip: bool,
    pub raw_download: bool,
    pub fix_md5: bool,
    pub no_metadata: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub catalog_url: String,
    pub downloads_dir: PathBuf,
    pub request_timeout_secs: u64,
    pub auto_retry_delay: Duration,

    // External tools
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub flac_path: PathBuf,

    pub download: DownloadSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let catalog_url = file
            .catalog_url
            .or_else(|| cli.catalog_url.clone())
            .ok_or_else(|| {
                anyhow!("catalog_url must be specified via --catalog-url or in config file")
            })?;
        if !catalog_url.starts_with("http://") && !catalog_url.starts_with("https://") {
            bail!("catalog_url must be an http(s) URL: {}", catalog_url);
        }

        let downloads_dir = file
            .downloads_dir
            .map(PathBuf::from)
            .or_else(|| cli.downloads_dir.clone())
            .unwrap_or_else(|| PathBuf::from("./downloads"));
        if downloads_dir.exists() && !downloads_dir.is_dir() {
            bail!("downloads_dir is not a directory: {:?}", downloads_dir);
        }

        let request_timeout_secs = file
            .request_timeout_secs
            .unwrap_or(cli.request_timeout_secs);
        if request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }

        let dl_file = file.download.unwrap_or_default();
        let defaults = DownloadSettings::default();

        let output_codec = match dl_file.output_codec {
            Some(codec) => codec.parse().map_err(|e: String| anyhow!(e))?,
            None => cli.output_codec.unwrap_or(defaults.output_codec),
        };
        let output_quality = match dl_file.output_quality {
            Some(tier) => tier.to_string().parse().map_err(|e: String| anyhow!(e))?,
            None => cli.output_quality.unwrap_or(defaults.output_quality),
        };

        let download = DownloadSettings {
            output_codec,
            output_quality,
            bitrate: dl_file.bitrate.or(cli.bitrate).unwrap_or(defaults.bitrate),
            apply_metadata: dl_file.apply_metadata.unwrap_or(!cli.no_metadata),
            fix_md5: dl_file.fix_md5.unwrap_or(cli.fix_md5),
            create_zip: dl_file.create_zip.unwrap_or(cli.create_zip),
            raw_download: dl_file.raw_download.unwrap_or(cli.raw_download),
            max_concurrent_downloads: dl_file
                .max_concurrent_downloads
                .or(cli.max_concurrent_downloads)
                .unwrap_or(defaults.max_concurrent_downloads),
            album_art_size: dl_file.album_art_size.unwrap_or(defaults.album_art_size),
            album_art_quality: dl_file
                .album_art_quality
                .unwrap_or(defaults.album_art_quality),
            zip_name: dl_file.zip_name.unwrap_or(defaults.zip_name),
            track_name: dl_file.track_name.unwrap_or(defaults.track_name),
            max_file_size: dl_file.max_file_size.unwrap_or(defaults.max_file_size),
            duration_tolerance_ms: dl_file
                .duration_tolerance_ms
                .unwrap_or(defaults.duration_tolerance_ms),
        }
        .normalized();

        Ok(Self {
            catalog_url,
            downloads_dir,
            request_timeout_secs,
            auto_retry_delay: Duration::from_millis(file.auto_retry_delay_ms.unwrap_or(2000)),
            ffmpeg_path: PathBuf::from(file.ffmpeg_path.unwrap_or_else(|| "ffmpeg".to_string())),
            ffprobe_path: PathBuf::from(
                file.ffprobe_path.unwrap_or_else(|| "ffprobe".to_string()),
            ),
            flac_path: PathBuf::from(file.flac_path.unwrap_or_else(|| "flac".to_string())),
            download,
        })
    }
}

/// Per-download settings. A copy is snapshotted into every retry item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSettings {
    pub output_codec: OutputCodec,
    pub output_quality: QualityTier,
    /// kbit/s, lossy codecs only.
    pub bitrate: u32,
    pub apply_metadata: bool,
    /// FLAC output only.
    pub fix_md5: bool,
    pub create_zip: bool,
    /// Keep the fetched format; tags are still applied.
    pub raw_download: bool,
    pub max_concurrent_downloads: usize,
    pub album_art_size: u32,
    pub album_art_quality: f32,
    pub zip_name: String,
    pub track_name: String,
    pub max_file_size: u64,
    /// How much shorter than the catalog duration a decoded file may be.
    pub duration_tolerance_ms: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            output_codec: OutputCodec::Flac,
            output_quality: QualityTier::HiRes192,
            bitrate: MAX_BITRATE,
            apply_metadata: true,
            fix_md5: false,
            create_zip: false,
            raw_download: false,
            max_concurrent_downloads: 3,
            album_art_size: MAX_ALBUM_ART_SIZE,
            album_art_quality: 1.0,
            zip_name: "{artists} - {name}".to_string(),
            track_name: "{track_number} - {name}{explicit}".to_string(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            duration_tolerance_ms: 1000,
        }
    }
}

impl DownloadSettings {
    /// Clamps numeric settings into their accepted ranges.
    pub fn normalized(mut self) -> Self {
        self.bitrate = self.bitrate.clamp(MIN_BITRATE, MAX_BITRATE);
        self.max_concurrent_downloads = self.max_concurrent_downloads.clamp(1, 10);
        self.album_art_size = self
            .album_art_size
            .clamp(MIN_ALBUM_ART_SIZE, MAX_ALBUM_ART_SIZE);
        self.album_art_quality = if self.album_art_quality.is_nan() {
            1.0
        } else {
            self.album_art_quality.clamp(0.1, 1.0)
        };
        self
    }

    /// Tiers the fallback engine may walk, best first.
    ///
    /// Raw and lossy downloads may end at any tier. A lossless target only accepts
    /// lossless sources unless the lossy tier itself was requested.
    pub fn fallback_tiers(&self) -> Vec<QualityTier> {
        if self.raw_download
            || self.output_codec.is_lossy()
            || self.output_quality == QualityTier::Mp3
        {
            QualityTier::ALL.to_vec()
        } else {
            QualityTier::ALL
                .iter()
                .copied()
                .filter(QualityTier::is_lossless)
                .collect()
        }
    }

    /// Codec written for a payload fetched at `actual`.
    pub fn effective_codec(&self, actual: QualityTier) -> OutputCodec {
        if self.raw_download {
            OutputCodec::native_for(actual)
        } else {
            self.output_codec
        }
    }

    /// Bitrate passed to the encoder for `codec`, if any.
    pub fn bitrate_for(&self, codec: OutputCodec) -> Option<u32> {
        if self.raw_download || !codec.is_lossy() {
            None
        } else {
            Some(self.bitrate.clamp(MIN_BITRATE, MAX_BITRATE))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli() -> CliConfig {
        CliConfig {
            catalog_url: Some("http://localhost:3000".to_string()),
            request_timeout_secs: 30,
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            downloads_dir: Some(temp_dir.path().to_path_buf()),
            output_codec: Some(OutputCodec::Mp3),
            output_quality: Some(QualityTier::Cd),
            bitrate: Some(192),
            max_concurrent_downloads: Some(5),
            create_zip: true,
            no_metadata: true,
            ..cli()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.catalog_url, "http://localhost:3000");
        assert_eq!(config.downloads_dir, temp_dir.path());
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.auto_retry_delay, Duration::from_millis(2000));
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert_eq!(config.download.output_codec, OutputCodec::Mp3);
        assert_eq!(config.download.output_quality, QualityTier::Cd);
        assert_eq!(config.download.bitrate, 192);
        assert_eq!(config.download.max_concurrent_downloads, 5);
        assert!(config.download.create_zip);
        assert!(!config.download.apply_metadata);
        assert!(!config.download.raw_download);
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let cli = CliConfig {
            output_codec: Some(OutputCodec::Aac),
            bitrate: Some(128),
            create_zip: true,
            ..cli()
        };
        let file_config = FileConfig {
            catalog_url: Some("https://catalog.example".to_string()),
            downloads_dir: Some("/toml/downloads".to_string()),
            download: Some(DownloadConfig {
                output_codec: Some("opus".to_string()),
                output_quality: Some(7),
                create_zip: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        assert_eq!(config.catalog_url, "https://catalog.example");
        assert_eq!(config.downloads_dir, PathBuf::from("/toml/downloads"));
        assert_eq!(config.download.output_codec, OutputCodec::Opus);
        assert_eq!(config.download.output_quality, QualityTier::HiRes96);
        assert!(!config.download.create_zip);
        // CLI value used when TOML doesn't specify
        assert_eq!(config.download.bitrate, 128);
    }

    #[test]
    fn test_resolve_missing_catalog_url_error() {
        let result = AppConfig::resolve(&CliConfig::default(), None);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("catalog_url must be specified"));
    }

    #[test]
    fn test_resolve_rejects_bad_values() {
        let bad_url = CliConfig {
            catalog_url: Some("ftp://catalog".to_string()),
            ..cli()
        };
        assert!(AppConfig::resolve(&bad_url, None).is_err());

        let file_config = FileConfig {
            download: Some(DownloadConfig {
                output_codec: Some("vorbis".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli(), Some(file_config)).is_err());

        let file_config = FileConfig {
            download: Some(DownloadConfig {
                output_quality: Some(9),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli(), Some(file_config)).is_err());

        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let cli_with_file = CliConfig {
            downloads_dir: Some(temp_file.path().to_path_buf()),
            ..cli()
        };
        let err = AppConfig::resolve(&cli_with_file, None).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn test_settings_are_clamped() {
        let file_config = FileConfig {
            download: Some(DownloadConfig {
                bitrate: Some(1000),
                max_concurrent_downloads: Some(0),
                album_art_size: Some(10),
                album_art_quality: Some(3.0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli(), Some(file_config)).unwrap();
        assert_eq!(config.download.bitrate, 320);
        assert_eq!(config.download.max_concurrent_downloads, 1);
        assert_eq!(config.download.album_art_size, 100);
        assert_eq!(config.download.album_art_quality, 1.0);
    }

    #[test]
    fn test_fallback_tiers() {
        let lossless = DownloadSettings::default();
        assert_eq!(
            lossless.fallback_tiers(),
            vec![QualityTier::HiRes192, QualityTier::HiRes96, QualityTier::Cd]
        );

        let raw = DownloadSettings {
            raw_download: true,
            ..Default::default()
        };
        assert_eq!(raw.fallback_tiers(), QualityTier::ALL.to_vec());

        let mp3 = DownloadSettings {
            output_codec: OutputCodec::Mp3,
            ..Default::default()
        };
        assert_eq!(mp3.fallback_tiers(), QualityTier::ALL.to_vec());
    }

    #[test]
    fn test_effective_codec_and_bitrate() {
        let raw = DownloadSettings {
            raw_download: true,
            output_codec: OutputCodec::Aac,
            ..Default::default()
        };
        assert_eq!(raw.effective_codec(QualityTier::Cd), OutputCodec::Flac);
        assert_eq!(raw.effective_codec(QualityTier::Mp3), OutputCodec::Mp3);
        assert_eq!(raw.bitrate_for(OutputCodec::Mp3), None);

        let aac = DownloadSettings {
            output_codec: OutputCodec::Aac,
            bitrate: 256,
            ..Default::default()
        };
        assert_eq!(aac.effective_codec(QualityTier::Mp3), OutputCodec::Aac);
        assert_eq!(aac.bitrate_for(OutputCodec::Aac), Some(256));
        assert_eq!(aac.bitrate_for(OutputCodec::Flac), None);
    }
}
