//! Catalog data model as returned by the catalog backend.

use chrono::{DateTime, Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

fn default_true() -> bool {
    true
}

fn default_media_number() -> u32 {
    1
}

/// Discrete audio quality offered upstream, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualityTier {
    /// 24-bit / 192 kHz lossless.
    #[serde(rename = "27")]
    HiRes192,
    /// 24-bit / 96 kHz lossless.
    #[serde(rename = "7")]
    HiRes96,
    /// 16-bit / 44.1 kHz lossless.
    #[serde(rename = "6")]
    Cd,
    /// MP3 at 320 kbps.
    #[serde(rename = "5")]
    Mp3,
}

impl QualityTier {
    /// Every tier, highest first.
    pub const ALL: [QualityTier; 4] = [
        QualityTier::HiRes192,
        QualityTier::HiRes96,
        QualityTier::Cd,
        QualityTier::Mp3,
    ];

    /// Upstream format identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::HiRes192 => "27",
            QualityTier::HiRes96 => "7",
            QualityTier::Cd => "6",
            QualityTier::Mp3 => "5",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QualityTier::HiRes192 => "24-bit / 192 kHz",
            QualityTier::HiRes96 => "24-bit / 96 kHz",
            QualityTier::Cd => "16-bit / 44.1 kHz",
            QualityTier::Mp3 => "MP3 320 kbps",
        }
    }

    pub fn is_lossless(&self) -> bool {
        !matches!(self, QualityTier::Mp3)
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "27" => Ok(QualityTier::HiRes192),
            "7" => Ok(QualityTier::HiRes96),
            "6" => Ok(QualityTier::Cd),
            "5" => Ok(QualityTier::Mp3),
            other => Err(format!(
                "unknown quality tier '{}', expected one of 27, 7, 6, 5",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArtistRef {
    #[serde(default)]
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AlbumArtist {
    #[serde(default)]
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Genre {
    #[serde(default)]
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Label {
    #[serde(default)]
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AlbumImage {
    #[serde(default)]
    pub small: String,
    #[serde(default)]
    pub thumbnail: String,
    #[serde(default)]
    pub large: String,
}

/// Album as listed in search results, artist releases and track payloads.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub artist: Option<ArtistRef>,
    #[serde(default)]
    pub artists: Vec<AlbumArtist>,
    #[serde(default)]
    pub image: AlbumImage,
    #[serde(default)]
    pub label: Option<Label>,
    #[serde(default)]
    pub genre: Option<Genre>,
    /// Original release date, `YYYY-MM-DD`.
    #[serde(default)]
    pub release_date_original: Option<String>,
    /// Release timestamp in seconds.
    #[serde(default)]
    pub released_at: Option<i64>,
    #[serde(default)]
    pub upc: Option<String>,
    #[serde(default)]
    pub parental_warning: bool,
    #[serde(default)]
    pub tracks_count: u32,
    /// Total duration in seconds.
    #[serde(default)]
    pub duration: u64,
    #[serde(default = "default_true")]
    pub streamable: bool,
}

impl Album {
    /// Title with the version suffix, e.g. `Title (Deluxe)`.
    pub fn display_title(&self) -> String {
        with_version(&self.title, self.version.as_deref())
    }

    /// Album artists joined by `, `, falling back to the main artist.
    pub fn display_artists(&self) -> String {
        if !self.artists.is_empty() {
            return self
                .artists
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
        }
        match &self.artist {
            Some(artist) if !artist.name.is_empty() => artist.name.clone(),
            _ => VARIOUS_ARTISTS.to_string(),
        }
    }

    /// Name of the first credited album artist.
    pub fn primary_artist(&self) -> String {
        self.artists
            .first()
            .map(|a| a.name.clone())
            .or_else(|| self.artist.as_ref().map(|a| a.name.clone()))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| VARIOUS_ARTISTS.to_string())
    }

    /// Full resolution cover URL derived from the large image URL.
    ///
    /// Large images end in a 7 character size suffix such as `600.jpg`.
    pub fn full_res_image_url(&self) -> Option<String> {
        let large = self.image.large.as_str();
        if large.len() <= 7 || !large.is_char_boundary(large.len() - 7) {
            return None;
        }
        Some(format!("{}org.jpg", &large[..large.len() - 7]))
    }

    pub fn release_year(&self) -> Option<i32> {
        if let Some(date) = &self.release_date_original {
            if let Ok(parsed) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
                return Some(parsed.year());
            }
        }
        self.released_at
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.year())
    }
}

pub const VARIOUS_ARTISTS: &str = "Various Artists";

fn with_version(title: &str, version: Option<&str>) -> String {
    match version {
        Some(version) if !version.trim().is_empty() => {
            format!("{} ({})", title, version.trim()).trim().to_string()
        }
        _ => title.trim().to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Catalog reported duration in seconds.
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub track_number: u32,
    #[serde(default = "default_media_number")]
    pub media_number: u32,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub copyright: Option<String>,
    #[serde(default)]
    pub performer: Option<ArtistRef>,
    #[serde(default)]
    pub parental_warning: bool,
    #[serde(default = "default_true")]
    pub streamable: bool,
    /// Present on standalone track payloads, absent in album track listings.
    #[serde(default)]
    pub album: Option<Box<Album>>,
}

impl Track {
    pub fn display_title(&self) -> String {
        with_version(&self.title, self.version.as_deref())
    }

    /// Album artists when known, else the performer.
    pub fn display_artists(&self) -> String {
        if let Some(album) = &self.album {
            if !album.artists.is_empty() {
                return album.display_artists();
            }
        }
        match &self.performer {
            Some(performer) if !performer.name.is_empty() => performer.name.clone(),
            _ => VARIOUS_ARTISTS.to_string(),
        }
    }

    /// Copy of this track carrying `album` as its parent.
    pub fn with_album(&self, album: &Album) -> Track {
        let mut track = self.clone();
        if track.album.is_none() {
            track.album = Some(Box::new(album.clone()));
        }
        track
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackPage {
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub items: Vec<Track>,
}

/// Album with its ordered track listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedAlbum {
    #[serde(flatten)]
    pub album: Album,
    #[serde(default)]
    pub tracks: TrackPage,
}

impl FetchedAlbum {
    /// Tracks that can be streamed, each carrying the album as parent.
    pub fn streamable_tracks(&self) -> Vec<Track> {
        self.tracks
            .items
            .iter()
            .filter(|t| t.streamable)
            .map(|t| t.with_album(&self.album))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReleaseType {
    #[serde(rename = "album")]
    Album,
    #[serde(rename = "epSingle")]
    EpSingle,
    #[serde(rename = "live")]
    Live,
    #[serde(rename = "compilation")]
    Compilation,
}

impl ReleaseType {
    pub const ALL: [ReleaseType; 4] = [
        ReleaseType::Album,
        ReleaseType::EpSingle,
        ReleaseType::Live,
        ReleaseType::Compilation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseType::Album => "album",
            ReleaseType::EpSingle => "epSingle",
            ReleaseType::Live => "live",
            ReleaseType::Compilation => "compilation",
        }
    }
}

impl FromStr for ReleaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "album" => Ok(ReleaseType::Album),
            "epSingle" | "ep-single" | "ep" => Ok(ReleaseType::EpSingle),
            "live" => Ok(ReleaseType::Live),
            "compilation" => Ok(ReleaseType::Compilation),
            other => Err(format!("unknown release type '{}'", other)),
        }
    }
}

/// One page of an artist's releases.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReleasePage {
    #[serde(default)]
    pub items: Vec<Album>,
    #[serde(default)]
    pub has_more: bool,
}

/// What the user asked to download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogItem {
    Track(Box<Track>),
    Album {
        album_id: String,
        title: Option<String>,
    },
}

impl CatalogItem {
    pub fn title(&self) -> String {
        match self {
            CatalogItem::Track(track) => track.display_title(),
            CatalogItem::Album { album_id, title } => {
                title.clone().unwrap_or_else(|| format!("Album {}", album_id))
            }
        }
    }
}
