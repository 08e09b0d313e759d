//! Archive packaging and cover art preparation.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use std::io::{Cursor, Write};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One file inside an archive, `/` separated.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    pub path: String,
    pub bytes: Vec<u8>,
}

impl ArchiveEntry {
    pub fn new(path: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            bytes,
        }
    }
}

/// Builds an in-memory zip with stored entries. Audio is already compressed.
pub fn build_zip(entries: &[ArchiveEntry]) -> Result<Vec<u8>, PackagingError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(entries.iter().map(|e| e.bytes.len() as u64).sum::<u64>() > u32::MAX as u64);
    for entry in entries {
        writer.start_file(entry.path.as_str(), options)?;
        writer.write_all(&entry.bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}

/// Downscales `bytes` to fit within `max_size` pixels and re-encodes as JPEG.
///
/// `quality` is 0.1..=1.0. Images already within bounds are only re-encoded.
pub fn resize_cover_art(bytes: &[u8], max_size: u32, quality: f32) -> Result<Vec<u8>, PackagingError> {
    let mut img = image::load_from_memory(bytes)?;
    if img.width() > max_size || img.height() > max_size {
        img = img.resize(max_size, max_size, FilterType::Lanczos3);
    }
    let quality = (quality.clamp(0.1, 1.0) * 100.0).round() as u8;

    let mut out = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
        encoder.encode_image(&img.to_rgb8())?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Read;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_build_zip_stores_entries() {
        let bytes = build_zip(&[
            ArchiveEntry::new("Artist/Album/01 - One.flac", b"one".to_vec()),
            ArchiveEntry::new("Artist/Album/cover.jpg", b"jpeg".to_vec()),
        ])
        .unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut file = archive.by_name("Artist/Album/01 - One.flac").unwrap();
        assert_eq!(file.compression(), CompressionMethod::Stored);
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"one");
    }

    #[test]
    fn test_resize_preserves_aspect() {
        let resized = resize_cover_art(&png(400, 200), 100, 0.8).unwrap();
        let img = image::load_from_memory(&resized).unwrap();
        assert_eq!((img.width(), img.height()), (100, 50));
        assert_eq!(image::guess_format(&resized).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn test_small_art_is_not_upscaled() {
        let resized = resize_cover_art(&png(64, 64), 3600, 1.0).unwrap();
        let img = image::load_from_memory(&resized).unwrap();
        assert_eq!((img.width(), img.height()), (64, 64));
    }

    #[test]
    fn test_garbage_art_is_an_error() {
        assert!(matches!(
            resize_cover_art(b"not an image", 100, 1.0),
            Err(PackagingError::Image(_))
        ));
    }
}
