//! `;FFMETADATA1` tag documents.

use crate::catalog::{Album, Track, VARIOUS_ARTISTS};

/// Tags written into the output container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackTags {
    pub title: String,
    pub artist: String,
    pub album_artist: String,
    pub album: String,
    pub genre: Option<String>,
    pub date: Option<String>,
    pub year: Option<i32>,
    pub label: Option<String>,
    pub copyright: Option<String>,
    pub isrc: Option<String>,
    pub barcode: Option<String>,
    pub track: Option<u32>,
}

impl TrackTags {
    /// Tags for `track`; `album` supplies the release level fields.
    pub fn new(track: &Track, album: &Album) -> Self {
        let artist = if album.artists.is_empty() {
            track
                .performer
                .as_ref()
                .map(|p| p.name.clone())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| VARIOUS_ARTISTS.to_string())
        } else {
            album.display_artists()
        };

        Self {
            title: track.display_title(),
            album_artist: album.primary_artist(),
            artist,
            album: album.display_title(),
            genre: album.genre.as_ref().map(|g| g.name.clone()),
            date: album.release_date_original.clone(),
            year: album.release_year(),
            label: album.label.as_ref().map(|l| l.name.clone()),
            copyright: track.copyright.clone(),
            isrc: track.isrc.clone().filter(|isrc| !isrc.is_empty()),
            barcode: album.upc.clone().filter(|upc| !upc.is_empty()),
            track: Some(track.track_number).filter(|n| *n > 0),
        }
    }

    pub fn to_ffmetadata(&self) -> String {
        let mut doc = String::from(";FFMETADATA1\n");
        let mut push = |key: &str, value: &str| {
            doc.push_str(key);
            doc.push('=');
            doc.push_str(&escape(value));
            doc.push('\n');
        };

        push("title", &self.title);
        push("artist", &self.artist);
        push("album_artist", &self.album_artist);
        push("album", &self.album);
        if let Some(genre) = &self.genre {
            push("genre", genre);
        }
        if let Some(date) = &self.date {
            push("date", date);
        }
        if let Some(year) = self.year {
            push("year", &year.to_string());
        }
        if let Some(label) = &self.label {
            push("label", label);
        }
        if let Some(copyright) = &self.copyright {
            push("copyright", copyright);
        }
        if let Some(isrc) = &self.isrc {
            push("isrc", isrc);
        }
        if let Some(barcode) = &self.barcode {
            push("barcode", barcode);
        }
        if let Some(track) = self.track {
            push("track", &track.to_string());
        }
        doc
    }
}

/// `=`, `;`, `#`, `\` and newlines are special in the metadata format.
fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '=' | ';' | '#' | '\\' | '\n') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
