//! File and folder naming.
//!
//! Templates use `{artists}`, `{name}`, `{year}`, `{duration}`, `{track_number}` and
//! `{explicit}`. Unknown placeholders are left as written.

use std::collections::HashSet;

use crate::catalog::{Album, Track};

/// Characters that are unsafe in filenames across platforms.
const UNSAFE_CHARS: &[char] = &['/', '\\', '?', ':', '*', '"', '<', '>', '|'];

/// Replaces unsafe filesystem characters with underscores.
pub fn clean_file_name(s: &str) -> String {
    s.chars()
        .map(|c| if UNSAFE_CHARS.contains(&c) { '_' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// `1h 2m`, `3m 5s`, or `0m` for nothing.
pub fn format_duration(seconds: u64) -> String {
    if seconds == 0 {
        return "0m".to_string();
    }
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, secs)
    }
}

/// Values substituted into a naming template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateFields {
    pub artists: String,
    pub name: String,
    pub year: Option<i32>,
    pub duration_secs: u64,
    pub track_number: Option<u32>,
    pub explicit: bool,
}

impl TemplateFields {
    pub fn for_track(track: &Track, album: &Album) -> Self {
        Self {
            artists: if album.artists.is_empty() && album.artist.is_none() {
                track.display_artists()
            } else {
                album.display_artists()
            },
            name: track.display_title(),
            year: album.release_year(),
            duration_secs: track.duration,
            track_number: Some(track.track_number),
            explicit: track.parental_warning,
        }
    }

    pub fn for_album(album: &Album) -> Self {
        Self {
            artists: album.display_artists(),
            name: album.display_title(),
            year: album.release_year(),
            duration_secs: album.duration,
            track_number: None,
            explicit: album.parental_warning,
        }
    }

    fn lookup(&self, key: &str) -> Option<String> {
        let value = match key {
            "artists" => self.artists.clone(),
            "name" => self.name.clone(),
            "year" => self.year.map(|y| y.to_string()).unwrap_or_default(),
            "duration" => format_duration(self.duration_secs),
            "track_number" => self
                .track_number
                .map(|n| format!("{:02}", n))
                .unwrap_or_default(),
            "explicit" => {
                if self.explicit {
                    " (Explicit)".to_string()
                } else {
                    String::new()
                }
            }
            _ => return None,
        };
        Some(value)
    }
}

/// Substitutes every known `{placeholder}` in `template` in a single pass.
pub fn render_template(template: &str, fields: &TemplateFields) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match fields.lookup(key) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Cleaned `<template>.<extension>`; an empty rendering falls back to the title.
pub fn track_file_name(template: &str, track: &Track, album: &Album, extension: &str) -> String {
    let fields = TemplateFields::for_track(track, album);
    let mut stem = clean_file_name(&render_template(template, &fields));
    if stem.is_empty() {
        stem = clean_file_name(&fields.name);
    }
    if stem.is_empty() {
        stem = format!("track-{}", track.id);
    }
    format!("{}.{}", stem, extension)
}

/// Cleaned `<template>.zip`; an empty rendering falls back to the name field.
pub fn zip_file_name(template: &str, fields: &TemplateFields) -> String {
    let mut stem = clean_file_name(&render_template(template, fields));
    if stem.is_empty() {
        stem = clean_file_name(&fields.name);
    }
    if stem.is_empty() {
        stem = "download".to_string();
    }
    format!("{}.zip", stem)
}

pub fn artist_folder(album: &Album) -> String {
    clean_file_name(&album.primary_artist())
}

pub fn album_folder(album: &Album) -> String {
    let name = clean_file_name(&album.display_title());
    if name.is_empty() {
        clean_file_name(&album.id)
    } else {
        name
    }
}

/// Returns `name`, or `name (2)`, `name (3)`... if already taken, and records it.
pub fn unique_name(name: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.to_string()) {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };
    let mut n = 2;
    loop {
        let candidate = format!("{} ({}){}", stem, n, ext);
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}
