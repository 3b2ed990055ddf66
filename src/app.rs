//! Wiring of the ingestion service from a [`Config`].

use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::{self, AppState};
use crate::config::Config;
use crate::controller::{JobSettings, SimulationController};
use crate::generator::{GeneratorConfig, ReadingGenerator};
use crate::ingest::{Ingestor, SimulatorSink};
use crate::offline::{run_flush_loop, BufferedSink, OfflineBuffer};
use crate::store::{MemorySensorRegistry, MemoryStore, StoreError};

/// Initialize the tracing subscriber with environment-based filtering.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Generator bands taken from the configuration.
pub fn generator_config(config: &Config) -> GeneratorConfig {
    GeneratorConfig {
        temperature: config.temperature_band,
        humidity: config.humidity_band,
    }
}

/// Job timings taken from the configuration.
pub fn job_settings(config: &Config) -> JobSettings {
    JobSettings {
        interval: config.sim_interval,
        error_backoff: config.sim_error_backoff,
        stop_timeout: config.sim_stop_timeout,
    }
}

/// Sensors from `CONNECTED_ROOT_SENSORS_FILE`, or the built-in demo set.
pub fn load_registry(config: &Config) -> Result<MemorySensorRegistry, StoreError> {
    match &config.sensors_file {
        Some(path) => {
            let registry = MemorySensorRegistry::from_file(path)?;
            info!(path = %path.display(), sensors = registry.len(), "Sensors loaded from file");
            Ok(registry)
        }
        None => {
            let registry = MemorySensorRegistry::demo();
            info!(sensors = registry.len(), "Using demo sensors");
            Ok(registry)
        }
    }
}

/// The assembled ingestion service.
pub struct App {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub registry: Arc<MemorySensorRegistry>,
    /// Readings produced by server-side jobs while storage was down
    pub buffer: Arc<OfflineBuffer>,
}

impl App {
    pub fn new(config: &Config, store: Arc<MemoryStore>, registry: Arc<MemorySensorRegistry>) -> Self {
        let ingestor = Arc::new(
            Ingestor::new(store.clone(), registry.clone())
                .with_temperature_bounds(config.temperature_bounds)
                .with_sensor_check(config.sensor_check),
        );

        let buffer = Arc::new(OfflineBuffer::in_memory());
        let sink = BufferedSink::new(SimulatorSink::new(ingestor.clone()), buffer.clone());

        let controller = SimulationController::new(
            registry.clone(),
            Arc::new(sink),
            ReadingGenerator::new(generator_config(config)),
            job_settings(config),
        );

        Self {
            state: AppState::new(ingestor, controller, registry.clone()),
            store,
            registry,
            buffer,
        }
    }

    pub fn router(&self) -> Router {
        api::router(self.state.clone())
    }

    pub fn controller(&self) -> &SimulationController {
        &self.state.controller
    }

    /// Resend buffered job readings every `config.flush_interval`.
    pub fn spawn_flush_loop(&self, config: &Config, cancel: CancellationToken) -> JoinHandle<()> {
        let sink = SimulatorSink::new(self.state.ingestor.clone());
        tokio::spawn(run_flush_loop(
            self.buffer.clone(),
            sink,
            config.flush_interval,
            cancel,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Sensor;
    use std::time::Duration;

    fn fast_config() -> Config {
        Config {
            sim_interval: Duration::from_millis(20),
            sim_error_backoff: Duration::from_millis(10),
            flush_interval: Duration::from_millis(20),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_jobs_buffer_during_outage_and_recover() {
        let config = fast_config();
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(MemorySensorRegistry::new(vec![Sensor::new("s1", "temperatura")]));
        let app = App::new(&config, store.clone(), registry);

        store.set_available(false);
        app.controller().start("s1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        app.controller().stop_all().await;

        let buffered = app.buffer.len();
        assert!(buffered >= 1, "expected buffered readings");
        assert!(store.is_empty());

        store.set_available(true);
        let cancel = CancellationToken::new();
        let flusher = app.spawn_flush_loop(&config, cancel.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        flusher.await.unwrap();

        assert!(app.buffer.is_empty());
        assert_eq!(store.len(), buffered);
    }

    #[test]
    fn test_settings_follow_config() {
        let config = fast_config();
        let settings = job_settings(&config);
        assert_eq!(settings.interval, Duration::from_millis(20));
        assert_eq!(settings.stop_timeout, config.sim_stop_timeout);
        assert_eq!(generator_config(&config).humidity, config.humidity_band);
    }
}
