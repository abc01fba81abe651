use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::TimeDelta;
use clap::{ArgGroup, Args as ClapArgs, Parser};
use tracing::info;

use hourcount::clock::{Clock, SystemClock};
use hourcount::engine::{EngineConfig, VisitorEngine};
use hourcount::feed::jsonl::JsonLinesFeed;
use hourcount::feed::threaded::ThreadedFeed;
use hourcount::feed::DetectionFeed;
use hourcount::journal::{self, JsonLogger, SessionStartLog};
use hourcount::ledger::CsvLedger;
use hourcount::region::Region;
use hourcount::registry::RecountPolicy;
use hourcount::service::{LoopConfig, Runner};

/// Longest wait for a track record before the loop ticks without one.
const FEED_WAIT: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "hourcount", about = "Hourly unique visitor counting from a person tracker")]
#[command(group(ArgGroup::new("input").required(true).args(["tracks", "file", "rtsp"])))]
struct Args {
    /// JSON-lines track feed, one frame per line (`-` for stdin)
    #[arg(long, value_name = "PATH")]
    tracks: Option<PathBuf>,
    #[command(flatten)]
    capture: CaptureArgs,
    /// CSV file holding the date x hour counts
    #[arg(long, default_value = "data.csv")]
    ledger: PathBuf,
    /// Minimum absence before a track counts as a new visitor again
    #[arg(long, default_value_t = 30)]
    cooldown_minutes: u32,
    #[arg(long, value_enum, default_value_t = RecountPolicy::AfterCooldown)]
    recount_policy: RecountPolicy,
    /// Only count people inside LEFT,TOP,RIGHT,BOTTOM
    #[arg(long, value_name = "L,T,R,B")]
    region: Option<Region>,
    #[arg(long, default_value_t = 50)]
    tick_interval_ms: u64,
    /// Clock check interval outside operating hours
    #[arg(long, default_value_t = 1000)]
    idle_backoff_ms: u64,
    /// Pause after a failed frame before trying again
    #[arg(long, default_value_t = 5)]
    error_backoff_seconds: u64,
    #[arg(long, default_value_t = 300)]
    status_interval_seconds: u64,
    #[arg(long)]
    log_json: Option<PathBuf>,
}

#[cfg(feature = "opencv")]
#[derive(ClapArgs, Debug)]
struct CaptureArgs {
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
    #[arg(long, value_name = "URL")]
    rtsp: Option<String>,
    #[arg(long, default_value = "assets/cascades")]
    cascade_dir: PathBuf,
    #[arg(long, default_value_t = 1.1)]
    scale_factor: f64,
    #[arg(long, default_value_t = 6)]
    min_neighbors: i32,
    #[arg(long, default_value_t = 48)]
    min_size: i32,
    #[arg(long, default_value_t = 0.4)]
    nms_iou: f32,
    #[arg(long, default_value_t = 45)]
    max_missing: u32,
    #[arg(long, default_value_t = 1.2)]
    min_aspect_ratio: f32,
    #[arg(long, default_value_t = 4.0)]
    max_aspect_ratio: f32,
    /// Run detection every N frames (1 = every frame)
    #[arg(long, default_value_t = 3)]
    detection_interval: u64,
    /// Frames a track must persist before it can be counted
    #[arg(long, default_value_t = 3)]
    confirmation_frames: u32,
}

// video capture needs the `opencv` feature
#[cfg(not(feature = "opencv"))]
#[derive(ClapArgs, Debug)]
struct CaptureArgs {
    #[arg(long, value_name = "PATH", hide = true)]
    file: Option<PathBuf>,
    #[arg(long, value_name = "URL", hide = true)]
    rtsp: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> Result<()> {
    let feed = open_feed(&args)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Interrupt received - finishing current frame");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to install shutdown handler")?;

    let engine_config = EngineConfig {
        cooldown: TimeDelta::minutes(i64::from(args.cooldown_minutes)),
        policy: args.recount_policy,
    };
    let loop_config = LoopConfig {
        tick_interval: Duration::from_millis(args.tick_interval_ms),
        idle_backoff: Duration::from_millis(args.idle_backoff_ms),
        error_backoff: Duration::from_secs(args.error_backoff_seconds),
        status_interval: Duration::from_secs(args.status_interval_seconds),
    };

    let mut journal = match args.log_json.as_ref() {
        Some(path) => Some(JsonLogger::open(path)?),
        None => None,
    };
    if let Some(logger) = journal.as_mut() {
        logger.write_event(&SessionStartLog {
            event: "session_start",
            timestamp: journal::timestamp_now(),
            ledger: args.ledger.display().to_string(),
            cooldown_minutes: engine_config.cooldown.num_minutes(),
            recount_policy: format!("{:?}", engine_config.policy),
            region: args.region.map(|r| r.to_string()),
        })?;
        logger.flush()?;
    }

    let clock = SystemClock;
    let ledger = CsvLedger::new(&args.ledger);
    let engine = VisitorEngine::start(ledger, engine_config, clock.now())
        .with_context(|| format!("Failed to read ledger {}", args.ledger.display()))?;
    info!(
        cooldown_minutes = args.cooldown_minutes,
        policy = ?args.recount_policy,
        "Counting visitors into {}",
        args.ledger.display()
    );

    let mut runner =
        Runner::new(clock, feed, engine, loop_config, shutdown).with_journal(journal);
    runner.run();
    info!("Program exited safely");
    Ok(())
}

fn open_feed(args: &Args) -> Result<Box<dyn DetectionFeed>> {
    if let Some(path) = &args.tracks {
        let feed = JsonLinesFeed::open(path)
            .with_context(|| format!("Failed to open track feed {}", path.display()))?
            .with_region(args.region);
        let feed = ThreadedFeed::spawn(feed, FEED_WAIT).context("Failed to start feed reader")?;
        return Ok(Box::new(feed));
    }
    open_capture(args)
}

#[cfg(feature = "opencv")]
fn open_capture(args: &Args) -> Result<Box<dyn DetectionFeed>> {
    use hourcount::feed::cascade::{CascadeConfig, CascadeFeed};

    let capture = &args.capture;
    let source = match (&capture.file, &capture.rtsp) {
        (Some(file), _) => file.to_string_lossy().to_string(),
        (None, Some(url)) => url.clone(),
        (None, None) => bail!("Provide --tracks, --file or --rtsp"),
    };
    let config = CascadeConfig {
        cascade_dir: capture.cascade_dir.clone(),
        scale_factor: capture.scale_factor,
        min_neighbors: capture.min_neighbors,
        min_size: capture.min_size,
        nms_iou: capture.nms_iou,
        max_missing: capture.max_missing,
        min_aspect_ratio: capture.min_aspect_ratio,
        max_aspect_ratio: capture.max_aspect_ratio,
        detection_interval: capture.detection_interval,
        confirmation_frames: capture.confirmation_frames,
    };
    info!("Loading person detector...");
    let feed = CascadeFeed::open(&source, config, args.region)?;
    info!("Detector loaded successfully");
    Ok(Box::new(feed))
}

#[cfg(not(feature = "opencv"))]
fn open_capture(args: &Args) -> Result<Box<dyn DetectionFeed>> {
    if args.capture.file.is_some() || args.capture.rtsp.is_some() {
        bail!("Video capture requires building with --features opencv; use --tracks instead");
    }
    bail!("Provide --tracks PATH")
}
