//! Catalog fixtures.

use image::{ImageBuffer, ImageFormat, Rgb};
use std::io::Cursor;

use hifi_dl::catalog::{
    Album, AlbumArtist, AlbumImage, ArtistRef, FetchedAlbum, QualityTier, Track, TrackPage,
};

use super::constants::{ARTIST_NAME, IMAGE_BASE};

pub fn album(id: &str, title: &str) -> Album {
    Album {
        id: id.to_string(),
        title: title.to_string(),
        artists: vec![AlbumArtist {
            id: 1,
            name: ARTIST_NAME.to_string(),
            roles: vec![],
        }],
        image: AlbumImage {
            large: format!("{}covers/{}_600.jpg", IMAGE_BASE, id),
            ..Default::default()
        },
        release_date_original: Some("2001-03-12".to_string()),
        streamable: true,
        ..Default::default()
    }
}

pub fn track(id: u64, number: u32, title: &str, duration_secs: u64) -> Track {
    Track {
        id,
        title: title.to_string(),
        version: None,
        duration: duration_secs,
        track_number: number,
        media_number: 1,
        isrc: None,
        copyright: None,
        performer: Some(ArtistRef {
            id: 1,
            name: ARTIST_NAME.to_string(),
        }),
        parental_warning: false,
        streamable: true,
        album: None,
    }
}

pub fn fetched_album(album: Album, tracks: Vec<Track>) -> FetchedAlbum {
    FetchedAlbum {
        tracks: TrackPage {
            offset: 0,
            limit: tracks.len() as u32,
            total: tracks.len() as u32,
            items: tracks,
        },
        album,
    }
}

/// Distinct audio payload per track and tier.
pub fn payload(track_id: u64, tier: QualityTier) -> Vec<u8> {
    format!("audio-{}-{}", track_id, tier).into_bytes()
}

/// A small valid PNG.
pub fn cover_png() -> Vec<u8> {
    let image = ImageBuffer::from_pixel(8, 8, Rgb([200u8, 30, 30]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}
