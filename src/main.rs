use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hifi_dl::catalog::{CatalogClient, HttpCatalogClient, QualityTier, ReleaseType};
use hifi_dl::config::{AppConfig, CliConfig, FileConfig};
use hifi_dl::pipeline::transcode::{FfmpegEngine, OutputCodec, TranscodeQueue};
use hifi_dl::pipeline::{
    AlbumStatus, DownloadNotice, DownloadOrchestrator, DownloadService, FfprobeProbe,
    FlacHashFixer, ProgressState, ProgressTracker,
};
use hifi_dl::storage::LocalFileStore;

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[clap(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"))]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Base URL of the catalog backend.
    #[clap(long)]
    pub catalog_url: Option<String>,

    /// Directory downloads are written to.
    #[clap(long, value_parser = parse_path)]
    pub downloads_dir: Option<PathBuf>,

    /// Timeout in seconds for catalog requests.
    #[clap(long, default_value_t = 30)]
    pub timeout_sec: u64,

    /// Output codec: FLAC, ALAC, WAV, MP3, AAC or OPUS.
    #[clap(long)]
    pub codec: Option<OutputCodec>,

    /// Requested quality tier: 27, 7, 6 or 5.
    #[clap(long)]
    pub quality: Option<QualityTier>,

    /// Bitrate in kbps for lossy codecs.
    #[clap(long)]
    pub bitrate: Option<u32>,

    /// Number of downloads running at once (1-10).
    #[clap(long)]
    pub concurrency: Option<usize>,

    /// Package each download as a zip archive.
    #[clap(long)]
    pub zip: bool,

    /// Keep the native format instead of transcoding.
    #[clap(long)]
    pub raw: bool,

    /// Re-encode FLAC output so its stream MD5 is set.
    #[clap(long)]
    pub fix_md5: bool,

    /// Do not embed tags or cover art.
    #[clap(long)]
    pub no_metadata: bool,

    /// Keep tracks that decode shorter than their listed duration instead of queueing a retry.
    #[clap(long)]
    pub save_anyway: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download single tracks.
    Track {
        #[clap(required = true)]
        ids: Vec<u64>,
    },
    /// Download whole albums.
    Album {
        #[clap(required = true)]
        ids: Vec<String>,
    },
    /// Download an artist's releases.
    Artist {
        id: String,

        /// Only releases of this type: album, epSingle, live or compilation.
        #[clap(long)]
        release_type: Option<ReleaseType>,
    },
}

impl From<&CliArgs> for CliConfig {
    fn from(args: &CliArgs) -> Self {
        CliConfig {
            catalog_url: args.catalog_url.clone(),
            downloads_dir: args.downloads_dir.clone(),
            request_timeout_secs: args.timeout_sec,
            output_codec: args.codec,
            output_quality: args.quality,
            bitrate: args.bitrate,
            max_concurrent_downloads: args.concurrency,
            create_zip: args.zip,
            raw_download: args.raw,
            fix_md5: args.fix_md5,
            no_metadata: args.no_metadata,
        }
    }
}

/// One bar per album or standalone track, driven by progress snapshots.
struct ProgressBars {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ProgressBars {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn update(&self, state: &ProgressState) {
        let mut bars = self.bars.lock().unwrap_or_else(|p| p.into_inner());
        for (key, album) in &state.albums {
            let bar = bars.entry(key.clone()).or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(100));
                let style = ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>3}% {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#-");
                bar.set_style(style);
                bar
            });
            if bar.is_finished() {
                continue;
            }
            bar.set_position(album.overall_progress as u64);
            bar.set_message(format!(
                "{} - {} ({}/{})",
                album.artist,
                album.title,
                album.completed_tracks,
                album.total_tracks
            ));
            match album.status {
                AlbumStatus::Completed => bar.finish(),
                AlbumStatus::Failed => bar.abandon_with_message(format!("{} (failed)", album.title)),
                AlbumStatus::Cancelled => {
                    bar.abandon_with_message(format!("{} (cancelled)", album.title))
                }
                AlbumStatus::Pending | AlbumStatus::Downloading => {}
            }
        }
    }
}

fn log_notice(notice: &DownloadNotice) {
    match notice {
        DownloadNotice::Saved {
            title, file_name, ..
        } => info!("Saved \"{}\" to {}", title, file_name),
        DownloadNotice::AlbumSaved {
            title,
            saved,
            failed,
        } => info!("Album \"{}\": {} tracks saved, {} failed", title, saved, failed),
        DownloadNotice::QualityFallback {
            title,
            requested,
            actual,
        } => warn!(
            "\"{}\" was not available at {}, downloaded at {}",
            title,
            requested.label(),
            actual.label()
        ),
        DownloadNotice::RetryQueued {
            title,
            reason,
            error,
            auto_retry,
            ..
        } => {
            if *auto_retry {
                warn!("\"{}\" failed ({}), retrying: {}", title, reason, error)
            } else {
                warn!("\"{}\" failed ({}): {}", title, reason, error)
            }
        }
        DownloadNotice::RetrySucceeded { title, .. } => info!("Retry of \"{}\" succeeded", title),
        DownloadNotice::Failed {
            title,
            error,
            attempts,
        } => match attempts {
            Some((done, max)) => error!(
                "\"{}\" failed after {}/{} attempts: {}",
                title, done, max, error
            ),
            None => error!("\"{}\" failed: {}", title, error),
        },
        DownloadNotice::Cancelled { title } => info!("\"{}\" cancelled", title),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&CliConfig::from(&cli_args), file_config)?;

    info!(
        "Downloading from {} into {:?} as {} (quality {})",
        config.catalog_url,
        config.downloads_dir,
        config.download.output_codec.extension(),
        config.download.output_quality.label()
    );

    let catalog: Arc<dyn CatalogClient> = Arc::new(
        HttpCatalogClient::new(&config.catalog_url, config.request_timeout_secs)
            .context("Failed to create catalog client")?,
    );
    let store = Arc::new(
        LocalFileStore::new(&config.downloads_dir)
            .with_max_file_size(config.download.max_file_size),
    );
    let transcoder = Arc::new(TranscodeQueue::new(Box::new(FfmpegEngine::new(
        &config.ffmpeg_path,
    ))));
    let progress = ProgressTracker::new();
    let orchestrator = Arc::new(DownloadOrchestrator::new(
        catalog.clone(),
        transcoder,
        Arc::new(FlacHashFixer::new(&config.flac_path)),
        Arc::new(FfprobeProbe::new(&config.ffprobe_path)),
        store,
        progress.clone(),
    ));
    let service = DownloadService::new(
        orchestrator,
        config.download.clone(),
        config.auto_retry_delay,
    );

    let bars = Arc::new(ProgressBars::new());
    let bars_subscriber = bars.clone();
    let _subscription = progress.subscribe(move |state| bars_subscriber.update(state));

    let mut notices = service.subscribe();
    let notice_service = service.clone();
    let save_anyway = cli_args.save_anyway;
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => {
                    log_notice(&notice);
                    if let DownloadNotice::RetryQueued {
                        retry_id,
                        offer_save_anyway: true,
                        ..
                    } = &notice
                    {
                        if save_anyway {
                            if let Err(e) = notice_service.save_anyway(retry_id).await {
                                error!("Failed to save anyway: {:#}", e);
                            }
                        } else {
                            info!("Re-run with --save-anyway to keep the shorter file");
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} notices", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    match &cli_args.command {
        Command::Track { ids } => {
            for id in ids {
                match catalog.fetch_track(*id).await {
                    Ok(track) => {
                        service.submit_track(track);
                    }
                    Err(e) => error!("Track {} not available: {}", id, e),
                }
            }
        }
        Command::Album { ids } => {
            for id in ids {
                service.submit_album(id.clone(), None, None);
            }
        }
        Command::Artist { id, release_type } => {
            let jobs = service.submit_discography(id, *release_type).await?;
            if jobs.is_empty() {
                warn!("Artist {} has no releases", id);
            }
        }
    }

    tokio::select! {
        _ = service.wait_until_settled() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling downloads");
            service.shutdown();
            service.wait_until_settled().await;
        }
    }

    let state = service.progress().get_state();
    info!(
        "Done: {} completed, {} failed",
        state.completed_downloads, state.failed_downloads
    );
    let leftover = service.retry_queue().items();
    for item in &leftover {
        warn!(
            "Not downloaded: \"{}\" ({}, {}/{} attempts): {}",
            item.title(),
            item.reason,
            item.attempts,
            item.max_attempts,
            item.last_error
        );
    }
    if !leftover.is_empty() {
        anyhow::bail!("{} downloads did not complete", leftover.len());
    }
    Ok(())
}
