//! Command-line host for IsoKit.
//!
//! Drives a service worker against a real origin and runs caption overlays.
//! Results are printed to stdout as JSON; logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! # Install the worker and list what was precached
//! isokit-host install --config site.json
//!
//! # Dispatch fetches through an installed worker
//! isokit-host fetch --config site.json / /index.html
//! isokit-host fetch --config site.json --range bytes=0-99 /movie.mp4
//!
//! # Burn a caption into a clip
//! isokit-host overlay --video in.mp4 --font Arial.ttf --text "Hello" --output out.mp4
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{ArgAction, Parser, Subcommand};
use http::header::{CONTENT_RANGE, RANGE};
use http::{HeaderName, HeaderValue};
use isokit_common::{init_logging, retry_with_backoff_if, LogConfig, LogFormat, RetryConfig};
use isokit_net::{Fetcher, LoaderConfig, Request, ResourceLoader};
use isokit_overlay::{FfmpegEngine, OverlayEngine, OverlayJob, OverlaySpec};
use isokit_sw::{
    FetchEvent, FetchOutcome, InstallReport, ServiceWorker, ServiceWorkerError,
    ServiceWorkerEvent, WorkerConfig, CROSS_ORIGIN_EMBEDDER_POLICY, CROSS_ORIGIN_OPENER_POLICY,
};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "isokit-host")]
#[command(about = "Host for the IsoKit service worker and overlay engine")]
#[command(version)]
struct Cli {
    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the worker and print the precached entries
    Install {
        /// Worker configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Install attempts before giving up
        #[arg(long, default_value = "3")]
        attempts: u32,
    },

    /// Install the worker, then dispatch each path as a fetch event
    Fetch {
        /// Worker configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Range header sent with every request, e.g. "bytes=0-99"
        #[arg(long)]
        range: Option<String>,
        /// Install attempts before giving up
        #[arg(long, default_value = "3")]
        attempts: u32,
        /// Paths resolved against the configured origin
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Burn a timed caption into a video
    Overlay {
        /// Input video
        #[arg(long)]
        video: PathBuf,
        /// TrueType font for the caption
        #[arg(long)]
        font: PathBuf,
        /// Caption text
        #[arg(long)]
        text: String,
        #[arg(long, default_value = "50")]
        x: u32,
        #[arg(long, default_value = "50")]
        y: u32,
        /// Seconds into the clip when the caption appears
        #[arg(long, default_value = "1")]
        start: f64,
        /// Seconds the caption stays visible
        #[arg(long, default_value = "5")]
        duration: f64,
        #[arg(long, default_value = "20")]
        font_size: u32,
        /// Where to write the captioned video
        #[arg(short, long)]
        output: PathBuf,
        /// ffmpeg program to run
        #[arg(long, default_value = "ffmpeg")]
        ffmpeg: PathBuf,
        /// Kill ffmpeg after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format));

    match cli.command {
        Commands::Install { config, attempts } => {
            let config = WorkerConfig::load(&config)?;
            let (worker, report) = install(&config, fetcher()?, attempts).await?;

            let mut keys: Vec<String> = worker
                .cache()
                .keys()
                .await
                .into_iter()
                .map(|key| key.url().to_string())
                .collect();
            keys.sort();

            print_json(&json!({
                "worker_id": report.worker_id,
                "cache_name": report.cache_name,
                "entries": report.entries,
                "keys": keys,
            }))?;
        }

        Commands::Fetch {
            config,
            range,
            attempts,
            paths,
        } => {
            let config = WorkerConfig::load(&config)?;
            let (worker, _report) = install(&config, fetcher()?, attempts).await?;

            for path in &paths {
                let request = fetch_request(&config, path, range.as_deref())?;
                let url = request.url.to_string();

                let (event, reply) = FetchEvent::new(request);
                worker.dispatch_event(event);
                let outcome = reply
                    .await
                    .context("worker dropped the fetch event")?
                    .with_context(|| format!("fetching {url}"))?;

                print_json(&outcome_json(&url, &outcome))?;
            }

            worker.dispatcher().settle().await;
        }

        Commands::Overlay {
            video,
            font,
            text,
            x,
            y,
            start,
            duration,
            font_size,
            output,
            ffmpeg,
            timeout_secs,
        } => {
            let spec = OverlaySpec {
                text,
                x,
                y,
                start_time: start,
                duration,
                font_size,
            };
            let job = OverlayJob {
                video: read_bytes(&video).await?,
                font: read_bytes(&font).await?,
                spec,
            };

            let mut engine = FfmpegEngine::new().with_program(ffmpeg);
            if let Some(secs) = timeout_secs {
                engine = engine.with_timeout(Duration::from_secs(secs));
            }

            let encoded = engine.overlay(job).await?;
            tokio::fs::write(&output, &encoded)
                .await
                .with_context(|| format!("writing {}", output.display()))?;

            print_json(&json!({
                "output": output.display().to_string(),
                "bytes": encoded.len(),
            }))?;
        }
    }

    Ok(())
}

fn fetcher() -> anyhow::Result<Arc<dyn Fetcher>> {
    Ok(Arc::new(ResourceLoader::new(LoaderConfig::default())?))
}

/// Install a worker, starting over with a fresh one after each failed attempt.
///
/// Errors that another attempt cannot fix, such as an invalid config, end
/// the loop at once.
async fn install(
    config: &WorkerConfig,
    fetcher: Arc<dyn Fetcher>,
    attempts: u32,
) -> anyhow::Result<(Arc<ServiceWorker>, InstallReport)> {
    if attempts == 0 {
        bail!("--attempts must be at least 1");
    }

    let retry = RetryConfig {
        max_attempts: attempts,
        ..Default::default()
    };
    let storage = config.cache_storage();

    let (worker, events, report) = retry_with_backoff_if(
        &retry,
        || {
            let config = config.clone();
            let storage = storage.clone();
            let fetcher = Arc::clone(&fetcher);
            async move {
                let (worker, events) = ServiceWorker::new(config, &storage, fetcher).await?;
                let report = worker.install().await?;
                Ok::<_, ServiceWorkerError>((worker, events, report))
            }
        },
        ServiceWorkerError::is_retryable,
    )
    .await
    .context("installing service worker")?;

    tokio::spawn(log_events(events));
    info!(cache = %report.cache_name, entries = report.entries, "Worker installed");

    Ok((Arc::new(worker), report))
}

async fn log_events(mut events: mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ServiceWorkerEvent::StateChange {
                worker_id,
                new_state,
            } => debug!(worker = worker_id.raw(), state = %new_state, "Worker state"),
            ServiceWorkerEvent::CacheWriteFailed { url, error } => {
                warn!(url = %url, error = %error, "Response not cached")
            }
        }
    }
}

fn fetch_request(config: &WorkerConfig, path: &str, range: Option<&str>) -> anyhow::Result<Request> {
    let url = config
        .resolve(path)
        .with_context(|| format!("resolving {path}"))?;
    let mut request = Request::get(url);
    if let Some(range) = range {
        let value = HeaderValue::from_str(range).context("invalid --range value")?;
        request = request.header(RANGE, value);
    }
    Ok(request)
}

fn outcome_json(url: &str, outcome: &FetchOutcome) -> serde_json::Value {
    let response = &outcome.response;
    let header = |name: HeaderName| {
        response
            .headers()
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };

    json!({
        "url": url,
        "status": response.status().as_u16(),
        "status_text": response.status_text(),
        "route": format!("{:?}", outcome.route),
        "content_range": header(CONTENT_RANGE),
        "body_bytes": response.body().len(),
        "cross_origin_opener_policy": header(CROSS_ORIGIN_OPENER_POLICY),
        "cross_origin_embedder_policy": header(CROSS_ORIGIN_EMBEDDER_POLICY),
    })
}

async fn read_bytes(path: &Path) -> anyhow::Result<Bytes> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(Bytes::from(data))
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
