use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::codec::{OutputCodec, SourceFormat};
use super::engine::{EngineError, TranscodeEngine};
use super::metadata::TrackTags;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("transcoding engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("transcode operation {0} cancelled before it started")]
    Cancelled(String),

    #[error("transcoding queue is closed")]
    QueueClosed,
}

/// One request against the shared engine.
pub struct TranscodeOperation {
    /// Namespaces every scratch file this operation creates.
    pub id: String,
    pub input: Vec<u8>,
    pub source: SourceFormat,
    pub codec: OutputCodec,
    /// Target bitrate in kbps, lossy codecs only.
    pub bitrate_kbps: Option<u32>,
    pub tags: Option<TrackTags>,
    pub cover_art: Option<Arc<Vec<u8>>>,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for TranscodeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeOperation")
            .field("id", &self.id)
            .field("input_len", &self.input.len())
            .field("source", &self.source)
            .field("codec", &self.codec)
            .field("bitrate_kbps", &self.bitrate_kbps)
            .field("tags", &self.tags.is_some())
            .field("cover_art", &self.cover_art.as_ref().map(|a| a.len()))
            .finish()
    }
}

fn new_operation_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

impl TranscodeOperation {
    pub fn new(
        input: Vec<u8>,
        source: SourceFormat,
        codec: OutputCodec,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: new_operation_id(),
            input,
            source,
            codec,
            bitrate_kbps: None,
            tags: None,
            cover_art: None,
            cancel,
        }
    }

    pub fn with_bitrate(mut self, kbps: u32) -> Self {
        self.bitrate_kbps = Some(kbps);
        self
    }

    pub fn with_tags(mut self, tags: TrackTags) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_cover_art(mut self, art: Arc<Vec<u8>>) -> Self {
        self.cover_art = Some(art);
        self
    }

    /// True when the source already is the requested encoding.
    pub fn skips_reencode(&self) -> bool {
        match (self.source, self.codec) {
            (SourceFormat::Flac, OutputCodec::Flac) => true,
            (SourceFormat::Mp3, OutputCodec::Mp3) => self.bitrate_kbps.unwrap_or(320) == 320,
            _ => false,
        }
    }

    fn reencode_args(&self, input: &str, output: &str) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            input.to_string(),
            "-c:a".to_string(),
            self.codec.encoder().to_string(),
        ];
        if self.codec.is_lossy() {
            if let Some(kbps) = self.bitrate_kbps {
                args.push("-b:a".to_string());
                args.push(format!("{}k", kbps));
            }
        }
        if self.codec == OutputCodec::Opus {
            args.push("-vbr".to_string());
            args.push("on".to_string());
        }
        args.push(output.to_string());
        args
    }

    /// Runs the operation against `engine`, removing every scratch file it created
    /// whatever the outcome.
    pub(super) async fn execute(
        mut self,
        engine: &mut dyn TranscodeEngine,
    ) -> Result<Vec<u8>, TranscodeError> {
        if self.skips_reencode() && self.tags.is_none() {
            return Ok(std::mem::take(&mut self.input));
        }

        let mut scratch = BTreeSet::new();
        let result = self.run_steps(engine, &mut scratch).await;
        for name in &scratch {
            if let Err(e) = engine.delete_file(name).await {
                debug!("Scratch file {} not removed: {}", name, e);
            }
        }
        if let Err(e) = &result {
            warn!("Transcode operation {} failed: {}", self.id, e);
        }
        result
    }

    async fn run_steps(
        &mut self,
        engine: &mut dyn TranscodeEngine,
        scratch: &mut BTreeSet<String>,
    ) -> Result<Vec<u8>, TranscodeError> {
        let id = self.id.clone();
        let extension = self.codec.extension();
        let mut buffer = std::mem::take(&mut self.input);

        if !self.skips_reencode() {
            let source_name = format!("source_{}.{}", id, self.source.extension());
            let encoded_name = format!("encoded_{}.{}", id, extension);
            scratch.insert(source_name.clone());
            engine.write_file(&source_name, &buffer).await?;
            scratch.insert(encoded_name.clone());
            engine
                .run(&self.reencode_args(&source_name, &encoded_name))
                .await?;
            buffer = engine.read_file(&encoded_name).await?;
        }

        let tags = match &self.tags {
            Some(tags) if self.codec.supports_metadata() => tags,
            _ => return Ok(buffer),
        };

        let input_name = format!("input_{}.{}", id, extension);
        let metadata_name = format!("metadata_{}.txt", id);
        let tagged_name = format!("tagged_{}.{}", id, extension);
        scratch.insert(input_name.clone());
        engine.write_file(&input_name, &buffer).await?;
        scratch.insert(metadata_name.clone());
        engine
            .write_file(&metadata_name, tags.to_ffmetadata().as_bytes())
            .await?;
        scratch.insert(tagged_name.clone());
        engine
            .run(&strings(&[
                "-i",
                &input_name,
                "-i",
                &metadata_name,
                "-map_metadata",
                "1",
                "-codec",
                "copy",
                &tagged_name,
            ]))
            .await?;

        let art = match &self.cover_art {
            Some(art) if self.codec.supports_cover_art() => art,
            _ => return Ok(engine.read_file(&tagged_name).await?),
        };

        let art_name = format!("albumArt_{}.jpg", id);
        let output_name = format!("output_{}.{}", id, extension);
        scratch.insert(art_name.clone());
        engine.write_file(&art_name, art).await?;
        scratch.insert(output_name.clone());
        engine
            .run(&strings(&[
                "-i",
                &tagged_name,
                "-i",
                &art_name,
                "-c",
                "copy",
                "-map",
                "0",
                "-map",
                "1",
                "-disposition:v:0",
                "attached_pic",
                &output_name,
            ]))
            .await?;
        Ok(engine.read_file(&output_name).await?)
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
