//! clipcast
//!
//! Captures clips from a device and trims, rescales or snapshots them with a
//! transcoding engine that runs on a background worker.

mod assets;
mod bridge;
mod capture;
mod config;
mod controller;
mod engine;
mod logging;
mod objects;
#[cfg(test)]
mod testutil;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use assets::{AssetCache, AssetUrls};
use bridge::{Bridge, ControllerState};
use capture::{CaptureSession, CaptureStatus, LoopbackDevices};
use config::Config;
use controller::{AssetRefs, ControllerSettings, JobKind, Preset, Status};
use engine::FfmpegFactory;
use objects::ObjectStore;

#[derive(Parser, Debug)]
#[command(name = "clipcast", version, about = "Capture, trim and snapshot video clips")]
struct Cli {
    /// Config file (defaults to the per-user config location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Download the engine assets into the local cache.
    Warm,
    /// Delete the cached engine assets.
    Clear,
    /// Show configuration and cache status.
    Status,
    /// Trim and optionally rescale a clip.
    Preview(PreviewArgs),
    /// Extract one frame as a JPEG.
    Snapshot(SnapshotArgs),
    /// Record from a replayed media file acting as the capture device.
    Record(RecordArgs),
}

#[derive(Parser, Debug)]
struct PreviewArgs {
    /// Input clip.
    input: PathBuf,

    /// Output path (defaults to the engine's output name).
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Trim start in seconds.
    #[arg(long)]
    start: Option<f64>,

    /// Trim length in seconds.
    #[arg(long)]
    duration: Option<f64>,

    /// Target width; height follows the aspect ratio unless given.
    #[arg(long)]
    width: Option<u32>,

    /// Target height; width follows the aspect ratio unless given.
    #[arg(long)]
    height: Option<u32>,

    /// Stream-copy into WebM instead of re-encoding to MP4.
    #[arg(long, default_value_t = false)]
    webm: bool,

    /// Constant rate factor (18-35, lower is better).
    #[arg(long)]
    crf: Option<u8>,

    /// x264 speed preset.
    #[arg(long, value_enum)]
    preset: Option<Preset>,
}

#[derive(Parser, Debug)]
struct SnapshotArgs {
    /// Input clip.
    input: PathBuf,

    /// Output JPEG path.
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Seek position in seconds.
    #[arg(long)]
    at: Option<f64>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// JPEG quality scale (2-31, lower is better).
    #[arg(long)]
    quality: Option<u8>,
}

#[derive(Parser, Debug)]
struct RecordArgs {
    /// Media file replayed as the capture device.
    source: PathBuf,

    /// Output path for the recording.
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// How long to record.
    #[arg(long, default_value_t = 3.0)]
    seconds: f64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = logging::init_logging(cli.verbose)?;
    info!("clipcast {} starting", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => Config::load_from(path.clone())?,
        None => Config::load()?,
    };
    info!("Configuration loaded from {:?}", config.config_path()?);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async move {
        match cli.cmd {
            Cmd::Warm => cmd_warm(&config).await,
            Cmd::Clear => cmd_clear(&config).await,
            Cmd::Status => cmd_status(&config).await,
            Cmd::Preview(args) => cmd_preview(&config, args).await,
            Cmd::Snapshot(args) => cmd_snapshot(&config, args).await,
            Cmd::Record(args) => cmd_record(&config, args).await,
        }
    })
}

async fn cmd_warm(config: &Config) -> Result<()> {
    let cache = AssetCache::new(config, ObjectStore::global());
    cache.warm().await?;
    eprintln!("engine assets cached");
    Ok(())
}

async fn cmd_clear(config: &Config) -> Result<()> {
    AssetCache::new(config, ObjectStore::global()).clear().await;
    eprintln!("engine asset cache cleared");
    Ok(())
}

async fn cmd_status(config: &Config) -> Result<()> {
    let cache = AssetCache::new(config, ObjectStore::global());
    println!("config:   {}", config.config_path()?.display());
    match config.cache_root() {
        Some(root) => println!("bucket:   {}", root.join(&config.assets.bucket).display()),
        None => println!("bucket:   unavailable"),
    }
    println!("cached:   {}", if cache.is_cached().await { "yes" } else { "no" });
    println!("runtime:  {}", cache.urls().script);
    println!("binary:   {}", cache.urls().binary);
    println!("program:  {}", config.engine.program.display());
    Ok(())
}

/// A bridge whose engine load has been requested, plus the cached asset
/// references it was given
struct EngineSession {
    bridge: Bridge,
    cached: Option<AssetRefs>,
}

impl EngineSession {
    async fn open(config: &Config) -> Result<Self> {
        let store = ObjectStore::global();
        let cache = AssetCache::new(config, store.clone());

        let cached = cache.local_refs().await.map(AssetRefs::from);
        if cached.is_none() {
            warn!("Engine assets are not cached; fetching from origin (run `clipcast warm` to cache)");
        }

        let settings = ControllerSettings {
            factory: Arc::new(FfmpegFactory::new(&config.engine, store.clone())),
            urls: AssetUrls::from_config(config),
            store,
            client: reqwest::Client::new(),
        };
        let bridge = Bridge::new(settings);
        bridge.load(cached.clone())?;

        let cancel = bridge.cancel_handle();
        ctrlc::set_handler(move || {
            info!("Ctrl+C received, canceling job...");
            cancel.cancel();
        })
        .context("Failed to install Ctrl+C handler")?;

        Ok(Self { bridge, cached })
    }

    /// Wait for the running job of `kind` to finish, reporting progress
    async fn finish(&self, kind: JobKind) -> Result<ControllerState> {
        let mut progress_rx = self.bridge.subscribe();
        let reporter = tokio::spawn(async move {
            let mut last_decile = -1;
            while progress_rx.changed().await.is_ok() {
                let progress = progress_rx.borrow().progress;
                let decile = (progress * 10.0).floor() as i64;
                if decile != last_decile {
                    info!("{} progress {}%", kind, decile * 10);
                    last_decile = decile;
                }
            }
        });

        let state = self
            .bridge
            .wait_for(|s| {
                (s.status == Status::Ready && s.result(kind).is_some())
                    || matches!(s.status, Status::Error | Status::Canceled | Status::Idle)
            })
            .await;
        reporter.abort();

        match state.status {
            Status::Ready => Ok(state),
            Status::Canceled => bail!("{} canceled", kind),
            _ => bail!(
                "{} failed: {}",
                kind,
                state.error.as_deref().unwrap_or("engine stopped")
            ),
        }
    }

    /// Write the result of `kind` to `out` (or its engine name)
    async fn save(
        &self,
        state: &ControllerState,
        kind: JobKind,
        out: Option<PathBuf>,
    ) -> Result<PathBuf> {
        let result = state
            .result(kind)
            .with_context(|| format!("no {} result", kind))?;
        let blob = self
            .bridge
            .store()
            .resolve(&result.url)
            .with_context(|| format!("{} result was already released", kind))?;

        let out = out.unwrap_or_else(|| PathBuf::from(&result.name));
        write_output(&out, blob.bytes()).await?;
        Ok(out)
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.bridge.shutdown();
        if let Some(refs) = self.cached.take() {
            let store = self.bridge.store();
            for url in [refs.script_ref, refs.binary_ref].into_iter().flatten() {
                store.revoke(&url);
            }
        }
    }
}

async fn read_input(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("read input '{}'", path.display()))
}

async fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("write output '{}'", path.display()))
}

fn file_name_hint(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

async fn cmd_preview(config: &Config, args: PreviewArgs) -> Result<()> {
    let mut params = config.preview_params(read_input(&args.input).await?);
    params.name = file_name_hint(&args.input);
    if let Some(start) = args.start {
        params.start = start;
    }
    if let Some(duration) = args.duration {
        params.duration = duration;
    }
    params.scale_width = args.width;
    params.scale_height = args.height;
    if args.webm {
        params.to_mp4 = false;
    }
    if let Some(crf) = args.crf {
        params.crf = crf;
    }
    if let Some(preset) = args.preset {
        params.preset = preset;
    }

    let session = EngineSession::open(config).await?;
    session.bridge.preview(params)?;
    let state = session.finish(JobKind::Preview).await?;
    let out = session.save(&state, JobKind::Preview, args.out).await?;

    eprintln!("wrote {}", out.display());
    Ok(())
}

async fn cmd_snapshot(config: &Config, args: SnapshotArgs) -> Result<()> {
    let mut params = config.snapshot_params(read_input(&args.input).await?);
    params.name = file_name_hint(&args.input);
    if let Some(at) = args.at {
        params.timestamp = at;
    }
    params.scale_width = args.width;
    params.scale_height = args.height;
    if let Some(quality) = args.quality {
        params.quality = quality;
    }

    let session = EngineSession::open(config).await?;
    session.bridge.snapshot(params)?;
    let state = session.finish(JobKind::Snapshot).await?;
    let out = session.save(&state, JobKind::Snapshot, args.out).await?;

    eprintln!("wrote {}", out.display());
    Ok(())
}

async fn cmd_record(config: &Config, args: RecordArgs) -> Result<()> {
    if !args.seconds.is_finite() || args.seconds <= 0.0 {
        bail!("--seconds must be positive");
    }

    let devices = LoopbackDevices::from_file(&args.source)
        .await
        .with_context(|| format!("open capture source '{}'", args.source.display()))?;
    info!("Capturing from {} ({})", args.source.display(), devices.container());
    let session = CaptureSession::from_config(
        &config.capture,
        Some(Arc::new(devices)),
        ObjectStore::global(),
    );

    session.init(Some(config.constraints())).await?;
    session.start()?;
    tokio::time::sleep(Duration::from_secs_f64(args.seconds)).await;
    session.stop();

    let state = session.wait_for(CaptureStatus::Stopped).await;
    let Some(recording) = state.recording.filter(|_| state.status == CaptureStatus::Stopped) else {
        bail!(
            "recording failed: {}",
            state.error.as_deref().unwrap_or("no data recorded")
        );
    };

    let extension = if recording.blob.mime().starts_with("video/mp4") {
        "mp4"
    } else {
        "webm"
    };
    let out = args
        .out
        .unwrap_or_else(|| PathBuf::from(format!("recording.{}", extension)));
    write_output(&out, recording.blob.bytes()).await?;

    eprintln!(
        "wrote {} ({} bytes, {})",
        out.display(),
        recording.blob.len(),
        recording.blob.mime()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_preview_flags() {
        let cli = Cli::try_parse_from([
            "clipcast", "preview", "clip.webm", "--duration", "5", "--height", "720", "--preset",
            "medium", "-o", "out.mp4",
        ])
        .unwrap();
        let Cmd::Preview(args) = cli.cmd else {
            panic!("expected preview");
        };
        assert_eq!(args.duration, Some(5.0));
        assert_eq!(args.height, Some(720));
        assert_eq!(args.preset, Some(Preset::Medium));
        assert_eq!(args.out, Some(PathBuf::from("out.mp4")));
        assert!(!args.webm);
    }
}
