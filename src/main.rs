//! # Glitch Logger
//!
//! Event-triggered telemetry data logger for process-control environments.
//!
//! Samples configured channels on a fixed cadence, watches alarm/transition/
//! glitch trigger sources, and writes the circular-buffer window around each
//! trigger to per-dataset JSONL pages.

use std::time::Instant;

use anyhow::{Context, Result};
use tokio::time::interval;
use tracing::{error, info};

use glitch_logger::capture::controller::CaptureController;
use glitch_logger::config::Config;
use glitch_logger::provider::sim::SimProvider;
use glitch_logger::sink::jsonl::JsonlSink;
use glitch_logger::sink::TabularSink;

/// Configuration file used when no path is given on the command line.
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Main entry point for the Glitch Logger.
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Set up logging with tracing subscriber
///    - Load and validate the TOML configuration
///    - Connect every referenced channel and open one JSONL sink per dataset
///
/// 2. **Sampling Loop**
///    - One tick per configured interval: read channels, store snapshots,
///      advance each dataset's capture state machine, flush triggered pages
///    - Handle Ctrl+C for graceful shutdown
///
/// 3. **Graceful Shutdown**
///    - Flush any capture still in service with the rows buffered so far
///    - Close every sink and exit
///
/// # Errors
///
/// Returns an error if:
/// - The configuration is missing or invalid
/// - A channel cannot be connected or a sink cannot be opened
/// - A page write fails or the read-failure budget is exceeded
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Glitch Logger v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;
    info!(
        "Loaded configuration from {} ({} datasets)",
        config_path,
        config.datasets.len()
    );

    let sinks = config
        .datasets
        .iter()
        .map(|dataset| {
            Box::new(JsonlSink::new(
                &config.sink.directory,
                &config.sink.file_prefix,
                &dataset.name,
                &config.sink.marker_file,
            )) as Box<dyn TabularSink + Send>
        })
        .collect();

    let provider = SimProvider::new();
    let mut controller = CaptureController::new(&config, provider, sinks)
        .await
        .context("Failed to initialize capture controller")?;

    let mut tick_interval = interval(controller.interval());
    let started = Instant::now();

    info!(
        "Sampling every {:?}, writing pages to {}",
        controller.interval(),
        config.sink.directory
    );
    info!("Press Ctrl+C to exit");

    // Main sampling loop
    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                if let Err(e) = controller.tick(started.elapsed()).await {
                    error!("Fatal sampling error: {}", e);
                    // Best-effort close so already-buffered pages survive.
                    let _ = controller.finish(started.elapsed()).await;
                    return Err(e.into());
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    controller
        .finish(started.elapsed())
        .await
        .context("Shutdown flush failed")?;
    info!("Sampled {} steps, exiting", controller.step());

    Ok(())
}
