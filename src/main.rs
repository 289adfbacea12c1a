//! rtsp-recorder
//!
//! Records an RTSP camera stream into rotating MP4 segments until Ctrl+C.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use rtsp_recorder::logging::init_logging;
use rtsp_recorder::{
    Config, DirectoryHandle, RecordingController, RecordingOutcome, RtspConnector, StatusEvent,
    StreamDescriptor,
};

struct Args {
    url: String,
    output: Option<PathBuf>,
    config: Option<PathBuf>,
    username: Option<String>,
    password: Option<String>,
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = std::env::args().skip(1);
    let mut url = None;
    let mut output = None;
    let mut config = None;
    let mut username = None;
    let mut password = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "-o" | "--output" => output = Some(PathBuf::from(value(&mut args, &arg)?)),
            "-c" | "--config" => config = Some(PathBuf::from(value(&mut args, &arg)?)),
            "-u" | "--user" => username = Some(value(&mut args, &arg)?),
            "-p" | "--password" => password = Some(value(&mut args, &arg)?),
            other if other.starts_with('-') => bail!("Unknown option: {}", other),
            other => {
                if url.replace(other.to_string()).is_some() {
                    bail!("Only one stream URL may be given");
                }
            }
        }
    }

    let Some(url) = url else {
        return Ok(None);
    };
    Ok(Some(Args {
        url,
        output,
        config,
        username,
        password,
    }))
}

fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next()
        .with_context(|| format!("{} requires a value", flag))
}

fn main() -> Result<ExitCode> {
    let Some(args) = parse_args()? else {
        print_help();
        return Ok(ExitCode::SUCCESS);
    };

    // Dropped after everything else in main so the file appender flushes
    let _log_guard = init_logging()?;
    info!("rtsp-recorder {} starting...", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded from {:?}", config.config_path());

    let mut descriptor = StreamDescriptor::parse(&args.url)?;
    if let Some(username) = args.username {
        descriptor = descriptor.with_credentials(username, args.password.unwrap_or_default());
    }

    let output_dir = args
        .output
        .or_else(|| config.recording.output_directory.clone())
        .unwrap_or_else(|| std::env::temp_dir().join("rtsp-recordings"));
    let storage = DirectoryHandle::open(&output_dir)
        .with_context(|| format!("Cannot write to output directory {:?}", output_dir))?;
    info!("Writing segments to {:?}", output_dir);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;

    let outcome = runtime.block_on(async move {
        let connector = Arc::new(RtspConnector::new(&config.transport));
        let mut controller = RecordingController::new(config, connector);
        let status_rx = controller.subscribe();

        let handle = controller.handle();
        ctrlc::set_handler(move || {
            info!("Ctrl+C received, stopping recording...");
            handle.stop();
        })
        .context("Failed to install Ctrl+C handler")?;

        tokio::spawn(relay_status(status_rx));

        controller.start(descriptor, Arc::new(storage))?;
        info!("Recording run {} started (Ctrl+C to stop)", controller.run_id());

        anyhow::Ok(controller.wait().await)
    })?;

    println!(
        "{}",
        serde_json::to_string_pretty(&outcome).context("Failed to serialize outcome")?
    );

    match outcome.error_kind() {
        Some(kind) => error!("Recording failed: {}", kind),
        None => info!("Shutdown complete"),
    }
    Ok(ExitCode::from(exit_status(&outcome)))
}

/// Process exit status for a finished run
fn exit_status(outcome: &RecordingOutcome) -> u8 {
    match outcome {
        RecordingOutcome::Stopped { .. } => 0,
        RecordingOutcome::Failed { .. } => 1,
    }
}

/// Stand-in for a foreground notification: log each status change
async fn relay_status(mut rx: broadcast::Receiver<StatusEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let StatusEvent::SegmentClosed(info) = &event {
                    info!(
                        "Segment {} saved: {} ({} bytes)",
                        info.index, info.name, info.bytes
                    );
                }
                if let Some(text) = event.notification_text() {
                    info!(target: "notification", "{}", text);
                }
                if matches!(event, StatusEvent::Finished(_)) {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Status relay lagged, {} events skipped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_help() {
    println!("rtsp-recorder - Record an RTSP stream into rotating MP4 segments");
    println!();
    println!("USAGE:");
    println!("    rtsp-recorder [OPTIONS] <RTSP_URL>");
    println!();
    println!("OPTIONS:");
    println!("    -o, --output <DIR>       Directory to write segments to");
    println!("    -c, --config <FILE>      Config file (default: platform config dir)");
    println!("    -u, --user <NAME>        RTSP username");
    println!("    -p, --password <PASS>    RTSP password");
    println!("    -h, --help               Print this help message");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG                 Set log level (e.g., debug, info, warn)");
    println!("    RTSP_RECORDER_LOG_PATH   Override the log directory");
}
