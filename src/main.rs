//! CLI entry point for the test station.
//!
//! Builds a station backed by simulated devices, starts a test session and
//! acquisition on every device, and prints the aggregated window once a second.
//!
//! ```bash
//! test_station --config config/station.toml --duration-secs 30
//! test_station --log-format json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use test_station::config::StationConfig;
use test_station::device::SimulatedProvider;
use test_station::logging::{self, LogFormat};
use test_station::TestStation;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "test_station")]
#[command(about = "Mechanical test station core running on simulated devices", long_about = None)]
struct Cli {
    /// Station configuration file (TOML). The built-in demo station is used
    /// when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run for this many seconds, then stop. Runs until Ctrl-C when omitted.
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Overrides the configured log format.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => StationConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StationConfig::demo(),
    };
    if let Some(format) = cli.log_format {
        config.application.log_format = format;
    }
    logging::init(&config.application.logging())?;

    let station = TestStation::build(config, &SimulatedProvider::default())?;
    if let Some(settings) = station.controller_settings() {
        info!(
            channels = ?settings.max_channels,
            controllers = settings.ip_addrs.len(),
            "Controller settings loaded"
        );
    }
    station.connect_all().await?;

    let session = station.new_session(None);
    session.start();
    let device_ids = station.registry().ids();
    for id in &device_ids {
        if let Err(err) = station.start_acquisition(id) {
            warn!(device_id = %id, error = %err, "Acquisition not started");
        }
    }

    let deadline = async {
        match cli.duration_secs {
            Some(secs) => sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut report = interval(Duration::from_secs(1));
    report.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("Run duration elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = report.tick() => {
                for id in &device_ids {
                    match station.metrics(id) {
                        Some(m) => println!(
                            "{id}: n={} mean={:.3} min={:.3} max={:.3} sd={:.4}",
                            m.count, m.mean, m.min, m.max, m.std_dev
                        ),
                        None => println!("{id}: no samples yet"),
                    }
                }
            }
        }
    }

    session.stop();
    station.shutdown().await;
    println!(
        "Session {} finished ({})",
        session.name(),
        session.state()
    );
    Ok(())
}
