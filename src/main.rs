//! Connected Root - garden sensor telemetry ingestion service
//!
//! Serves the `/lecturas` and `/simulador` HTTP API, validates and stores
//! readings, and runs one simulation job per sensor on request.
//!
//! ## Features
//!
//! - Reading validation and in-memory storage behind axum routes
//! - Cancellable per-sensor simulation jobs
//! - Readings buffered while storage is down, resent on recovery
//! - Graceful shutdown on SIGINT
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables, see
//! [`connected_root::config::Config`]. The most common ones:
//!
//! - `CONNECTED_ROOT_BIND_ADDR`: HTTP listen address (default: 0.0.0.0:3000)
//! - `CONNECTED_ROOT_SIM_INTERVAL_SECS`: seconds between readings (default: 10)
//! - `CONNECTED_ROOT_SENSORS_FILE`: JSON array of sensors (default: demo sensors)
//! - `CONNECTED_ROOT_SENSOR_CHECK`: sensor check on `POST /lecturas` (default: none)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use connected_root::app::{self, load_registry, App};
use connected_root::config::Config;
use connected_root::store::MemoryStore;

#[tokio::main]
async fn main() {
    app::init_tracing();

    info!("Starting Connected Root service...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                bind_addr = %config.bind_addr,
                sim_interval_secs = config.sim_interval.as_secs(),
                sensor_check = ?config.sensor_check,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let registry = match load_registry(&config) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!(error = %e, "Failed to load sensors");
            std::process::exit(1);
        }
    };

    let app = App::new(&config, Arc::new(MemoryStore::new()), registry);

    let cancel = CancellationToken::new();
    let flush_handle = app.spawn_flush_loop(&config, cancel.clone());

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, bind_addr = %config.bind_addr, "Failed to bind HTTP listener");
            std::process::exit(1);
        }
    };

    info!(bind_addr = %config.bind_addr, "Connected Root listening. Press Ctrl+C to stop.");

    let server = axum::serve(listener, app.router()).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!(error = %e, "HTTP server failed");
    }

    info!("Initiating graceful shutdown...");

    app.controller().shutdown().await;

    cancel.cancel();
    if let Err(e) = flush_handle.await {
        warn!(error = %e, "Flush task panicked during shutdown");
    }

    let stranded = app.buffer.len();
    if stranded > 0 {
        warn!(pending = stranded, "Buffered readings dropped at shutdown");
    }

    info!("Connected Root stopped");
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
}
