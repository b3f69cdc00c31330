use anyhow::Result;
use std::env;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod clock;
mod config;
mod detector;
mod gpio;
mod net;
mod reporter;
mod selftest;
mod simulate;
mod store;
mod supervisor;
mod types;

use clock::{ClockSource, NtpClient};
use config::{Config, Timings};
use detector::DetectorState;
use net::HostLink;
use reporter::Reporter;
use simulate::SimulatedBoard;
use store::GitHubStore;
use supervisor::Supervisor;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::load()?;
    info!(
        station = %config.station_id,
        document = %config.document_url(),
        heartbeat_secs = config.heartbeat_interval_secs,
        "Bhangmeter node starting"
    );

    let timings = Timings::default();
    let board = Arc::new(SimulatedBoard::new(config.simulation.detector_healthy));
    simulate::spawn_script(Arc::clone(&board), &config.simulation);

    let detector = DetectorState::new();
    let clock = ClockSource::new(
        NtpClient::new(config.ntp_server.clone(), timings.ntp_timeout),
        timings.ntp_backoff,
    );
    let reporter = Reporter::new(
        GitHubStore::new(&config)?,
        clock,
        Arc::clone(&detector),
        config.station_id.clone(),
        config.location(),
        config.ntp_retries,
    );
    let link = HostLink::from_config(&config)?;

    let mut supervisor = Supervisor::new(board, detector, reporter, link, &config, timings);
    let result = supervisor.run().await;
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "Node stopped");
    }
    result
}
