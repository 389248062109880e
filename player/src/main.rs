//! rkplay
//!
//! Plays a raw elementary video stream on a Rockchip board: the MPP
//! hardware decoder writes pictures straight into DRM dumb buffers, which
//! are shown on an overlay plane without copying.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rk_common::{CodingFormat, DecoderEngine, DisplaySurfaceProvider, Fit, PixelFormat, PlayerConfig};
use rk_decoder::{MppLibrary, MppSession, SimDecoder, SimDecoderConfig};
use rk_display::{DrmDevice, DrmLibrary, SimDisplay};
use rk_pipeline::{Pipeline, PipelineConfig, PlaybackReport};

/// rkplay - zero-copy hardware video playback to a DRM overlay plane
#[derive(Parser, Debug)]
#[command(name = "rkplay")]
#[command(about = "Decode an elementary stream with Rockchip MPP and show it on a DRM overlay plane")]
#[command(version)]
struct Args {
    /// Raw elementary stream (e.g. an Annex-B H.264 file) followed by its
    /// coding format as a decoder id (7, 0x1000004) or name (h264, hevc, vp9, ...)
    #[arg(value_name = "INPUT CODING")]
    positionals: Vec<String>,

    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// DRM device node
    #[arg(long)]
    device: Option<PathBuf>,

    /// Number of shared decoder/display buffers
    #[arg(long)]
    pool_capacity: Option<usize>,

    /// Stretch the picture over the whole display instead of letterboxing
    #[arg(long)]
    fullscreen: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run the pipeline against the simulated decoder and display
    #[arg(long)]
    dry_run: bool,
}

impl Args {
    /// Input file and coding format, when exactly both were given.
    fn target(&self) -> Option<(PathBuf, &str)> {
        match self.positionals.as_slice() {
            [input, coding] => Some((PathBuf::from(input), coding.as_str())),
            _ => None,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let Some((input, coding)) = args.target() else {
        print_usage();
        return ExitCode::SUCCESS;
    };

    match run(&args, input, coding) {
        Ok(report) => {
            log_report(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    Args::command().print_help().ok();
    println!();
    println!("Coding formats:");
    for format in CodingFormat::ALL {
        let note = if format.is_streamable() {
            ""
        } else {
            " (not supported)"
        };
        println!(
            "  {:>10}  {:#010x}  {}{}",
            format.id(),
            format.id(),
            format.display_name(),
            note
        );
    }

    // The decoder's own table, when the runtime is installed.
    if let Ok(lib) = MppLibrary::load() {
        println!();
        lib.show_support_format();
    }
}

fn load_config(args: &Args) -> Result<PlayerConfig> {
    let mut config = match &args.config {
        Some(path) => PlayerConfig::load(path)?,
        None => PlayerConfig::default(),
    };
    if let Some(device) = &args.device {
        config.device = device.clone();
    }
    if let Some(capacity) = args.pool_capacity {
        config.pool_capacity = capacity;
    }
    if args.fullscreen {
        config.fit = Fit::Fullscreen;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &Args, input: PathBuf, coding: &str) -> Result<PlaybackReport> {
    let coding: CodingFormat = coding
        .parse()
        .with_context(|| format!("Invalid coding format {coding:?}"))?;
    let config = load_config(args).context("Failed to load configuration")?;
    let reader = File::open(&input)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open input {}", input.display()))?;

    info!(
        input = %input.display(),
        coding = %coding,
        device = %config.device.display(),
        pool_capacity = config.pool_capacity,
        fit = ?config.fit,
        dry_run = args.dry_run,
        "Starting playback"
    );

    if args.dry_run {
        warn!("Dry run: simulated decoder and display, nothing reaches the screen");
        let decoder = SimDecoder::new(SimDecoderConfig::default());
        let display = SimDisplay::default();
        return play(decoder, display, &config, reader);
    }

    let mpp = MppLibrary::load().context("Failed to load the MPP decoder library")?;
    let decoder = MppSession::new(Arc::new(mpp), coding, config.packet_size)
        .with_context(|| format!("Failed to create a {coding} decoder"))?;

    let drm = DrmLibrary::load().context("Failed to load libdrm")?;
    let display = DrmDevice::open(drm, &config.device, PixelFormat::Nv12)
        .with_context(|| format!("Failed to set up display on {}", config.device.display()))?;

    play(decoder, display, &config, reader)
}

fn play<D, P>(
    decoder: D,
    display: P,
    config: &PlayerConfig,
    reader: BufReader<File>,
) -> Result<PlaybackReport>
where
    D: DecoderEngine + 'static,
    P: DisplaySurfaceProvider + 'static,
{
    let pipeline = Pipeline::new(
        Arc::new(decoder),
        Arc::new(display),
        PipelineConfig::from(config),
    );
    let report = pipeline.run(reader).context("Playback failed")?;
    Ok(report)
}

fn log_report(report: &PlaybackReport) {
    info!(
        bytes = report.bytes_fed,
        packets = report.packets_fed,
        submit_retries = report.submit_retries,
        "Input"
    );
    match report.output_rect {
        Some(rect) => info!(
            decoded = report.pictures_decoded,
            presented = report.pictures_presented,
            skipped = report.pictures_skipped,
            max_skip_burst = report.max_skip_burst,
            pool_capacity = report.pool_capacity,
            output = %rect,
            "Playback complete"
        ),
        None => warn!("Stream ended before the decoder reported a resolution"),
    }
}
