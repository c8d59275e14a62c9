use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

use msg_uploader::config::DaemonConfig;
use msg_uploader::simulate::MeterSimulator;
use msg_uploader::{Channel, Delivery, SampleBuffer, Uploader};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = DaemonConfig::load().context("loading daemon config")?;
    info!(
        channel = %config.channel_name,
        uuid = %config.channel_uuid,
        middleware = %config.middleware,
        "Uploader daemon starting"
    );

    let buffer = Arc::new(
        SampleBuffer::open(&config.db_path)
            .with_context(|| format!("opening sample buffer at {}", config.db_path))?,
    );
    let channel = Channel::new(&config.channel_name, &config.channel_uuid, buffer.clone());
    let mut uploader = Uploader::new(channel, &config.uploader_options(), config.runtime_options())
        .context("invalid MySmartGrid options")?;

    let mut meter = MeterSimulator::default();
    let mut sample_interval = time::interval(Duration::from_secs(config.sample_interval_secs));
    let mut send_interval = time::interval(Duration::from_secs(config.send_tick_secs));

    loop {
        tokio::select! {
            _ = sample_interval.tick() => {
                let reading = meter.next_reading();
                if let Err(e) = buffer.push(&reading) {
                    error!(error = %e, "Failed to store reading");
                }
            }
            _ = send_interval.tick() => {
                match uploader.send().await {
                    Ok(Delivery::Accepted { measurements }) => {
                        info!(measurements, "Upload complete");
                    }
                    Ok(Delivery::Skipped) => {}
                    // already logged by the uploader; samples stay buffered
                    Err(_) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
