//! rawcap: capture a camera stream through FFmpeg and write the decoded frames as raw video

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::{error::ErrorKind, Parser};
use color_eyre::{eyre::eyre, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rawcap::pipeline::{CancelToken, CaptureLoop, CaptureParams, FfmpegSession, Termination};
use rawcap::{utils, Config};

#[derive(Parser, Debug)]
#[command(name = "rawcap", version)]
#[command(about = "Capture a camera through FFmpeg and dump decoded frames to a raw file")]
struct Args {
    /// Capture device, e.g. /dev/video2, or `auto`
    #[arg(required_unless_present = "list_devices")]
    input: Option<String>,

    /// Frame rate requested from the device, e.g. 30
    #[arg(required_unless_present = "list_devices")]
    fps: Option<String>,

    /// Frame size requested from the device, e.g. 640x480
    #[arg(required_unless_present = "list_devices")]
    size: Option<String>,

    /// Raw output file, created or truncated
    #[arg(required_unless_present = "list_devices")]
    output: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// List capture devices and exit
    #[arg(long)]
    list_devices: bool,
}

/// Time a cancelled capture gets to drain and flush before the process gives up
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Help and version requests succeed; every other argument error exits 1
fn usage_exit_code(err: &clap::Error) -> i32 {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}

fn parse_args() -> Args {
    match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = usage_exit_code(&e);
            if code == 0 {
                e.exit();
            }
            let _ = e.print();
            std::process::exit(code);
        }
    }
}

/// Wait for a cancelled capture to wind down.
///
/// `None` when a second interrupt arrives or the capture outlives `grace`, which
/// happens when the device stalls inside a blocking read.
async fn wind_down<F: Future>(
    capture: F,
    interrupt: impl Future,
    grace: Duration,
) -> Option<F::Output> {
    tokio::select! {
        joined = capture => Some(joined),
        _ = interrupt => {
            warn!("interrupted again");
            None
        }
        _ = tokio::time::sleep(grace) => {
            warn!(?grace, "capture did not stop in time");
            None
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let args = parse_args();

    let mut config = Config::load(args.config.as_deref())?;
    init_tracing(&config);

    if args.list_devices {
        let devices = utils::list_devices();
        if devices.is_empty() {
            println!("No capture devices found");
        }
        for device in devices {
            println!(
                "{}  {} ({}) {}",
                device.path,
                device.card,
                device.driver,
                device.input_format.as_deref().unwrap_or("-")
            );
        }
        return Ok(());
    }

    let (Some(input), Some(fps), Some(size), Some(output)) =
        (args.input, args.fps, args.size, args.output)
    else {
        return Err(eyre!("INPUT, FPS, SIZE and OUTPUT are required"));
    };

    let device = if utils::is_auto(&input) {
        let found = utils::auto_detect_device()?;
        if found.input_format.is_some() {
            config.capture.input_format = found.input_format.clone();
        }
        found.path
    } else {
        input
    };

    let params = CaptureParams {
        device,
        frame_rate: fps,
        frame_size: size,
        output,
    };
    params.validate()?;

    println!(
        "Capture {}, {}fps, {}, write to {}",
        params.device,
        params.frame_rate,
        params.frame_size,
        params.output.display()
    );

    let cancel = CancelToken::new();
    let loop_cancel = cancel.clone();

    // FFmpeg contexts are not Send: the session lives and dies on one blocking thread
    let mut capture = tokio::task::spawn_blocking(move || {
        let session = FfmpegSession::open(&params, &config)?;
        let hint = session
            .descriptor()
            .playback_hint(&params.output.display().to_string());
        println!("Play the output with: {hint}");

        let mut capture_loop = CaptureLoop::new(config.capture.backoff(), loop_cancel);
        let stats = session.run(&mut capture_loop)?;
        Ok::<_, rawcap::CaptureError>((stats, capture_loop.state()))
    });

    let outcome = tokio::select! {
        joined = &mut capture => joined,
        _ = signal::ctrl_c() => {
            info!("interrupted, stopping capture");
            cancel.cancel();
            match wind_down(&mut capture, signal::ctrl_c(), SHUTDOWN_GRACE).await {
                Some(joined) => joined,
                None => {
                    error!("capture thread is stuck, exiting without flushing the output");
                    std::process::exit(1);
                }
            }
        }
    };

    let (stats, state) = outcome.map_err(|e| eyre!("capture thread failed: {e}"))??;
    if state == rawcap::pipeline::LoopState::Terminated(Termination::Cancelled) {
        warn!("capture stopped before end of stream");
    }
    info!(
        packets = stats.packets_read,
        frames = stats.frames_written,
        decode_errors = stats.decode_errors,
        "done"
    );
    Ok(())
}
