//! qrscan: continuous QR marker scanning from a camera into a file.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use qrscan::capture::{DeviceId, SourceBackend, SourceFactory};
use qrscan::pipeline::{listen_for_interrupt, CancelToken, Pipeline, PipelineHandle, PipelineSettings};
use qrscan::{display, Config, FileSink, OutputMode, QrDetector};

#[derive(Debug, Parser)]
#[command(name = "qrscan", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Initial capture device (0-9)
    #[arg(short, long)]
    device: Option<DeviceId>,

    /// Output file for detected markers
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Append every new marker instead of overwriting the latest one
    #[arg(long)]
    append: bool,

    /// Use the synthetic test-pattern source instead of a camera
    #[arg(long)]
    synthetic: bool,

    /// Never open a preview window
    #[arg(long)]
    headless: bool,

    /// List capture devices and exit
    #[arg(long)]
    list_devices: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(device) = self.device {
            config.capture.device_id = device;
        }
        if let Some(output) = &self.output {
            config.output.path = output.clone();
        }
        if self.append {
            config.output.mode = OutputMode::Append;
        }
        if self.synthetic {
            config.capture.backend = SourceBackend::Synthetic;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qrscan=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();

    if args.list_devices {
        return list_devices();
    }

    let config_path = args.config.clone().or_else(Config::find_file);
    let mut config = Config::load(config_path.as_deref())
        .wrap_err_with(|| format!("failed to load configuration from {config_path:?}"))?;
    args.apply(&mut config);

    info!("qrscan launching...");
    info!(
        backend = ?config.capture.backend,
        device = config.capture.device_id,
        output = %config.output.path.display(),
        mode = ?config.output.mode,
        "configuration loaded"
    );

    let provider = Arc::new(SourceFactory::new(config.capture.clone())?);
    let detector = Box::new(QrDetector::new(config.detect.clone()));
    let sink = Arc::new(FileSink::new(config.output.path.clone()));

    let preview = !args.headless && display::preview_available();
    if !preview {
        info!("running headless");
    }
    let settings = PipelineSettings {
        preview,
        ..PipelineSettings::from_config(&config)
    };

    let cancel = CancelToken::new();
    let listener = listen_for_interrupt(cancel.clone());

    let running = Pipeline::new(provider, detector, sink, settings)
        .start(cancel.clone())
        .await
        .wrap_err("failed to start pipeline")?;

    if preview {
        let handle = running.handle();
        let display_config = config.display.clone();
        tokio::task::block_in_place(|| run_preview(&handle, &display_config));
    }

    let report = running.run_to_completion().await;
    cancel.cancel();
    listener.await.ok();

    let report = report?;
    info!(
        reason = %report.reason,
        written = report.stats.writes,
        duplicates = report.stats.duplicates,
        "qrscan shutting down"
    );
    Ok(())
}

#[cfg(feature = "preview")]
fn run_preview(handle: &PipelineHandle, config: &qrscan::DisplayConfig) {
    use color_eyre::eyre::eyre;

    let runtime = tokio::runtime::Handle::current();
    let result = sdl2::init()
        .map_err(|e| eyre!(e))
        .and_then(|sdl| display::PreviewWindow::new(&sdl, config)?.run(&sdl, handle, &runtime));
    if let Err(err) = result {
        // The pipeline keeps running headless; only an interrupt stops it now.
        warn!("preview unavailable: {err:#}");
    }
}

#[cfg(not(feature = "preview"))]
fn run_preview(_handle: &PipelineHandle, _config: &qrscan::DisplayConfig) {
    warn!("built without the preview feature");
}

#[cfg(feature = "v4l2")]
fn list_devices() -> Result<()> {
    let devices = qrscan::capture::v4l2::probe_devices();
    if devices.is_empty() {
        println!("no capture devices found");
    }
    for device in devices {
        println!("{}\t{}\t{:?}", device.id, device.card, device.format);
    }
    Ok(())
}

#[cfg(not(feature = "v4l2"))]
fn list_devices() -> Result<()> {
    Err(color_eyre::eyre::eyre!(
        "device probing needs the v4l2 feature"
    ))
}
