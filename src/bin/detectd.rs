//! detectd - clock probe + object detection HTTP service
//!
//! This daemon:
//! 1. Loads configuration and the detector backend
//! 2. Starts the clock probe
//! 3. Serves the HTTP API
//! 4. On SIGINT/SIGTERM stops the probe and the listener, then lets
//!    in-flight requests finish within the shutdown grace period

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use probe_detect::{
    api::{ApiConfig, ApiServer, AppState},
    config::ServiceConfig,
    BackendRegistry, DetectionPipeline, LifecycleController, StatusCell, SystemClock,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Clock probe and object detection HTTP service")]
struct Args {
    /// Path to a JSON configuration file.
    #[arg(long, env = "DETECTD_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration file.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = ServiceConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.addr = addr;
    }

    let registry = BackendRegistry::from_settings(&config.detector)?;
    let detector = registry.default_backend()?;
    detector
        .warm_up()
        .with_context(|| format!("warm up detector backend '{}'", detector.name()))?;
    log::info!(
        "detector backend '{}' loaded (available: {}), confidence floor {}",
        detector.name(),
        registry.list().join(", "),
        config.detector.confidence_floor
    );

    let pipeline = DetectionPipeline::new(detector, config.detector.confidence_floor)
        .with_jpeg_quality(config.upload.jpeg_quality);

    let status = Arc::new(StatusCell::new());
    let lifecycle = LifecycleController::new(config.probe_interval);
    let probe_cycles = lifecycle.start(Arc::new(SystemClock), status.clone())?;

    let api_config = ApiConfig {
        addr: config.addr.clone(),
        max_body_bytes: config.upload.max_bytes,
    };
    let state = AppState {
        status,
        pipeline: Arc::new(pipeline),
        probe_cycles,
    };
    let api_handle = ApiServer::new(api_config, state).spawn()?;
    log::info!("http api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting signal handler")?;

    log::info!("detectd running; waiting for shutdown signal (SIGINT/SIGTERM)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");

    let report = lifecycle.shutdown(config.shutdown_grace)?;
    if !report.probe_confirmed {
        log::warn!(
            "exiting without probe confirmation after {} ms",
            report.waited.as_millis()
        );
    }
    // In-flight requests get whatever the probe left of the grace period.
    let remaining = config.shutdown_grace.saturating_sub(report.waited);
    if !api_handle.drain(remaining)? {
        log::warn!("exiting with requests still in flight");
    }
    log::info!("detectd stopped");

    Ok(())
}
