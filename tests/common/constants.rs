//! Test constants shared across integration tests.

#![allow(dead_code)]

pub const CDN_BASE: &str = "https://cdn.test/";
pub const IMAGE_BASE: &str = "https://img.test/";

pub const ARTIST_ID: &str = "artist-1";
pub const ARTIST_NAME: &str = "Daft Punk";

pub const ALBUM_ID: &str = "album-1";
pub const ALBUM_TITLE: &str = "Discovery";

pub const TRACK_1_ID: u64 = 101;
pub const TRACK_2_ID: u64 = 102;
pub const TRACK_3_ID: u64 = 103;

/// What the fake probe reports for payloads without an explicit duration.
pub const LONG_DURATION_MS: u64 = 3_600_000;
