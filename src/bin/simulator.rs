//! Connected Root simulator - standalone sensor emulator
//!
//! Generates readings for a fixed set of sensors and posts them to a
//! running Connected Root API. Readings that cannot be delivered are kept in
//! a local JSON file and resent periodically.
//!
//! ## Configuration
//!
//! - `CONNECTED_ROOT_API_URL`: API base URL (default: http://localhost:3000)
//! - `CONNECTED_ROOT_SIM_SENSORS`: `id:tipo,...` (default: demo sensors)
//! - `CONNECTED_ROOT_SIM_INTERVAL_SECS`: seconds between readings (default: 10)
//! - `CONNECTED_ROOT_OFFLINE_BUFFER_PATH`: offline file (default: offline-readings.json)
//! - `CONNECTED_ROOT_FLUSH_INTERVAL_SECS`: resend interval (default: 30)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use connected_root::app::{self, generator_config, job_settings};
use connected_root::client::ApiClient;
use connected_root::config::Config;
use connected_root::controller::SimulationController;
use connected_root::generator::ReadingGenerator;
use connected_root::offline::{run_flush_loop, BufferedSink, OfflineBuffer};
use connected_root::reading::Sensor;
use connected_root::store::MemorySensorRegistry;

#[tokio::main]
async fn main() {
    app::init_tracing();

    info!("Starting Connected Root simulator...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                api_url = %config.api_url,
                sim_interval_secs = config.sim_interval.as_secs(),
                flush_interval_secs = config.flush_interval.as_secs(),
                max_retries = config.max_retries,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let client = match ApiClient::new(&config) {
        Ok(client) => {
            info!(ingest_url = %client.ingest_url(), "HTTP client initialized");
            Arc::new(client)
        }
        Err(e) => {
            error!(error = %e, "Failed to create HTTP client");
            std::process::exit(1);
        }
    };

    let buffer = match OfflineBuffer::open(config.offline_buffer_path.clone()) {
        Ok(buffer) => {
            info!(
                path = %config.offline_buffer_path.display(),
                pending = buffer.len(),
                "Offline buffer opened"
            );
            Arc::new(buffer)
        }
        Err(e) => {
            error!(error = %e, "Failed to open offline buffer");
            std::process::exit(1);
        }
    };

    match client.health().await {
        Ok(health) => info!(
            status = %health.status,
            sensores = health.sensores,
            lecturas = health.lecturas,
            "API reachable"
        ),
        Err(e) => warn!(error = %e, "API not reachable, readings will be buffered"),
    }

    let registry = Arc::new(simulated_sensors(&config));
    let sink = BufferedSink::new(client.clone(), buffer.clone());
    let controller = SimulationController::new(
        registry,
        Arc::new(sink),
        ReadingGenerator::new(generator_config(&config)),
        job_settings(&config),
    );

    match controller.start_all_active_sensors().await {
        Ok(report) if report.total == 0 => {
            error!("No active sensors to simulate");
            std::process::exit(1);
        }
        Ok(report) => info!(total = report.total, started = report.succeeded, "Simulations started"),
        Err(e) => {
            error!(error = %e, "Failed to start simulations");
            std::process::exit(1);
        }
    }

    let cancel = CancellationToken::new();
    let flush_handle = tokio::spawn(run_flush_loop(
        buffer.clone(),
        client,
        config.flush_interval,
        cancel.clone(),
    ));

    info!("Simulator running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    info!("Initiating graceful shutdown...");
    controller.shutdown().await;

    cancel.cancel();
    if let Err(e) = flush_handle.await {
        warn!(error = %e, "Flush task panicked during shutdown");
    }

    let stats = buffer.stats();
    info!(
        pending = buffer.len(),
        resent = stats.resent,
        rejected = stats.rejected,
        "Simulator stopped"
    );
}

/// Sensors from `CONNECTED_ROOT_SIM_SENSORS`, or the demo set when unset.
fn simulated_sensors(config: &Config) -> MemorySensorRegistry {
    if config.sim_sensors.is_empty() {
        return MemorySensorRegistry::demo();
    }

    MemorySensorRegistry::new(
        config
            .sim_sensors
            .iter()
            .map(|s| Sensor::new(s.id.clone(), s.tipo.clone()))
            .collect(),
    )
}
