// src/main.rs

mod compliance;
mod config;
mod detector;
mod frame_buffer;
mod pipeline;
mod postprocess;
mod preprocessing;
mod publisher;
mod stream;
mod types;

use anyhow::{Context, Result};
use pipeline::Pipeline;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use types::Config;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    init_tracing(&config.logging.level);

    info!("Starting PPE detection pipeline (device: {})", config.device_id);
    info!("Stream: {}", stream::mask_url(&config.stream.url));

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("Failed to install signal handler")?;
    }

    let source = stream::open_source(&config.stream)?;
    let reader = stream::StreamReader::new(source, &config.stream);
    let detector = detector::build_detector(&config.model)?;
    let publisher = publisher::build_publisher(&config.mqtt, &config.device_id)?;

    let mut pipeline = Pipeline::new(config, reader, detector, publisher, shutdown);
    pipeline.run()?;

    info!("Pipeline stopped");
    Ok(())
}
