//! Connected Root Library
//!
//! This library provides the pieces of the garden telemetry service:
//!
//! - **config**: Environment-based configuration
//! - **reading**: Reading, submission and sensor records
//! - **generator**: Band-weighted temperature and humidity generation
//! - **store**: Reading storage and sensor registry traits, in-memory backends
//! - **ingest**: Validation, persistence and read queries
//! - **controller**: One cancellable simulation job per sensor
//! - **offline**: Local retry buffer for readings that could not be stored
//! - **client**: HTTP client with connection pooling and retry logic
//! - **api**: axum routes for `/lecturas`, `/simulador` and `/health`
//! - **app**: Service wiring from a [`Config`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use connected_root::app::App;
//! use connected_root::config::Config;
//! use connected_root::store::{MemorySensorRegistry, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     let app = App::new(
//!         &config,
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(MemorySensorRegistry::demo()),
//!     );
//!     app.controller().start_all_active_sensors().await.ok();
//!
//!     let listener = tokio::net::TcpListener::bind(config.bind_addr).await.unwrap();
//!     axum::serve(listener, app.router()).await.unwrap();
//! }
//! ```

// Module declarations
pub mod api;
pub mod app;
pub mod client;
pub mod config;
pub mod controller;
pub mod generator;
pub mod ingest;
pub mod offline;
pub mod reading;
pub mod store;

// Re-export commonly used types at crate root for convenience
pub use api::{ApiError, AppState};
pub use app::App;
pub use client::{ApiClient, ClientError};
pub use config::{Config, ConfigError, SimulatedSensor};
pub use controller::{BatchReport, JobSettings, JobStatus, SimulationController, StopOutcome};
pub use generator::{GeneratorConfig, OptimalBand, ReadingGenerator};
pub use ingest::{IngestError, Ingestor, ReadingSink, SensorCheck, SimulatorSink, ValueBounds};
pub use offline::{BufferedSink, DeliverySink, FlushReport, OfflineBuffer};
pub use reading::{NewReading, Reading, ReadingKind, Sensor};
pub use store::{MemorySensorRegistry, MemoryStore, ReadingStore, SensorRegistry, StoreError};
