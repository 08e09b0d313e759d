//! Transcoding and tagging.
//!
//! The engine is a single stateful resource: [`TranscodeQueue`] owns it and runs
//! [`TranscodeOperation`]s strictly one after another, in submission order.

mod codec;
mod engine;
mod metadata;
mod operation;
mod queue;

pub use codec::{OutputCodec, SourceFormat};
pub use engine::{EngineError, FfmpegEngine, TranscodeEngine};
pub use metadata::TrackTags;
pub use operation::{TranscodeError, TranscodeOperation};
pub use queue::TranscodeQueue;
