use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::catalog::QualityTier;

/// Output container/codec the user can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputCodec {
    Flac,
    Wav,
    Alac,
    Mp3,
    Aac,
    Opus,
}

impl OutputCodec {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputCodec::Flac => "flac",
            OutputCodec::Wav => "wav",
            OutputCodec::Alac => "m4a",
            OutputCodec::Mp3 => "mp3",
            OutputCodec::Aac => "m4a",
            OutputCodec::Opus => "opus",
        }
    }

    /// Encoder name passed to `-c:a`.
    pub fn encoder(&self) -> &'static str {
        match self {
            OutputCodec::Flac => "flac",
            OutputCodec::Wav => "pcm_s16le",
            OutputCodec::Alac => "alac",
            OutputCodec::Mp3 => "libmp3lame",
            OutputCodec::Aac => "aac",
            OutputCodec::Opus => "libopus",
        }
    }

    pub fn is_lossy(&self) -> bool {
        matches!(self, OutputCodec::Mp3 | OutputCodec::Aac | OutputCodec::Opus)
    }

    /// WAV carries no tag block.
    pub fn supports_metadata(&self) -> bool {
        !matches!(self, OutputCodec::Wav)
    }

    pub fn supports_cover_art(&self) -> bool {
        !matches!(self, OutputCodec::Wav | OutputCodec::Opus)
    }

    /// Codec a tier is delivered in upstream.
    pub fn native_for(tier: QualityTier) -> Self {
        if tier.is_lossless() {
            OutputCodec::Flac
        } else {
            OutputCodec::Mp3
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputCodec::Flac => "FLAC",
            OutputCodec::Wav => "WAV",
            OutputCodec::Alac => "ALAC",
            OutputCodec::Mp3 => "MP3",
            OutputCodec::Aac => "AAC",
            OutputCodec::Opus => "OPUS",
        }
    }
}

impl fmt::Display for OutputCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OutputCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FLAC" => Ok(OutputCodec::Flac),
            "WAV" => Ok(OutputCodec::Wav),
            "ALAC" => Ok(OutputCodec::Alac),
            "MP3" => Ok(OutputCodec::Mp3),
            "AAC" => Ok(OutputCodec::Aac),
            "OPUS" => Ok(OutputCodec::Opus),
            other => Err(format!(
                "unknown codec '{}', expected one of FLAC, WAV, ALAC, MP3, AAC, OPUS",
                other
            )),
        }
    }
}

/// Format of the payload as delivered by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Flac,
    Mp3,
}

impl SourceFormat {
    pub fn for_tier(tier: QualityTier) -> Self {
        if tier.is_lossless() {
            SourceFormat::Flac
        } else {
            SourceFormat::Mp3
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SourceFormat::Flac => "flac",
            SourceFormat::Mp3 => "mp3",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_map() {
        let expected = [
            (OutputCodec::Flac, "flac", "flac"),
            (OutputCodec::Wav, "wav", "pcm_s16le"),
            (OutputCodec::Alac, "m4a", "alac"),
            (OutputCodec::Mp3, "mp3", "libmp3lame"),
            (OutputCodec::Aac, "m4a", "aac"),
            (OutputCodec::Opus, "opus", "libopus"),
        ];
        for (codec, extension, encoder) in expected {
            assert_eq!(codec.extension(), extension);
            assert_eq!(codec.encoder(), encoder);
        }
    }

    #[test]
    fn test_container_capabilities() {
        assert!(!OutputCodec::Wav.supports_metadata());
        assert!(!OutputCodec::Wav.supports_cover_art());
        assert!(OutputCodec::Opus.supports_metadata());
        assert!(!OutputCodec::Opus.supports_cover_art());
        assert!(OutputCodec::Alac.supports_cover_art());
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("flac".parse::<OutputCodec>().unwrap(), OutputCodec::Flac);
        assert_eq!(" Opus ".parse::<OutputCodec>().unwrap(), OutputCodec::Opus);
        assert!("ogg".parse::<OutputCodec>().is_err());
        assert!("aiff".parse::<OutputCodec>().is_err());
    }

    #[test]
    fn test_native_formats() {
        assert_eq!(OutputCodec::native_for(QualityTier::Cd), OutputCodec::Flac);
        assert_eq!(OutputCodec::native_for(QualityTier::Mp3), OutputCodec::Mp3);
        assert_eq!(SourceFormat::for_tier(QualityTier::HiRes192), SourceFormat::Flac);
        assert_eq!(SourceFormat::for_tier(QualityTier::Mp3).extension(), "mp3");
    }
}
