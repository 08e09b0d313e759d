//! Download pipeline.
//!
//! [`DownloadService`] admits jobs through the [`JobScheduler`], runs them with the
//! [`DownloadOrchestrator`] and files retryable failures into the [`RetryQueue`].

mod error;
mod md5_fix;
mod naming;
mod orchestrator;
mod packaging;
mod probe;
mod progress;
mod quality;
mod retry;
mod scheduler;
mod service;
pub mod transcode;

pub use error::{DegradedOutput, PipelineError, RetryReason};
pub use md5_fix::{FlacHashFixer, HashFixer, Md5FixError};
pub use naming::{clean_file_name, format_duration, render_template, TemplateFields};
pub use orchestrator::{
    AlbumOutcome, DownloadOrchestrator, DownloadResult, TrackFailure, RELEASES_PAGE_SIZE,
};
pub use packaging::{build_zip, resize_cover_art, ArchiveEntry, PackagingError};
pub use probe::{AudioProbe, FfprobeProbe, ProbeError};
pub use progress::{
    single_track_key, AlbumProgress, AlbumStatus, ProgressState, ProgressTracker, Subscription,
    TrackProgress, TrackStatus,
};
pub use quality::{fallback_order, FetchError, FetchedStream, QualityAttempt, QualityFallbackEngine};
pub use retry::{
    NewRetryItem, RetryItem, RetryOutcome, RetryQueue, RetryRunner, AUTO_MAX_ATTEMPTS,
    MANUAL_MAX_ATTEMPTS,
};
pub use scheduler::{
    Job, JobInfo, JobKind, JobScheduler, SchedulerEvent, DEFAULT_CONCURRENCY, MAX_CONCURRENCY,
    MIN_CONCURRENCY,
};
pub use service::{DownloadNotice, DownloadService};
