//! HTTP surface of the ingestion service.
//!
//! Routes are mounted at the root:
//!
//! - `/lecturas`: submit, list, latest and statistics
//! - `/simulador`: start and stop simulation jobs
//! - `/health`: storage check
//!
//! Every failure is rendered as `{success:false, error, code}` by
//! [`ApiError`].

pub mod error;
pub mod health;
pub mod lecturas;
pub mod simulador;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{ApiError, ApiErrorCode, ApiResult};

use crate::controller::SimulationController;
use crate::ingest::Ingestor;
use crate::store::SensorRegistry;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub controller: SimulationController,
    pub sensors: Arc<dyn SensorRegistry>,
}

impl AppState {
    pub fn new(
        ingestor: Arc<Ingestor>,
        controller: SimulationController,
        sensors: Arc<dyn SensorRegistry>,
    ) -> Self {
        Self {
            ingestor,
            controller,
            sensors,
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/lecturas",
            get(lecturas::list_readings).post(lecturas::create_reading),
        )
        .route("/lecturas/ultimas/:sensor_id", get(lecturas::latest_readings))
        .route("/lecturas/estadisticas", get(lecturas::reading_statistics))
        .route("/simulador/iniciar", post(simulador::start_simulation))
        .route("/simulador/detener", post(simulador::stop_simulation))
        .route("/simulador/iniciar-todos", post(simulador::start_all))
        .route("/simulador/detener-todos", post(simulador::stop_all))
        .route("/simulador/estado/:sensor_id", get(simulador::simulation_status))
        .route("/simulador/sensores", get(simulador::list_sensors))
        .route("/simulador/test-lectura/:sensor_id", post(simulador::test_reading))
        .fallback(|| async {
            tracing::warn!("Unmatched request - 404 Not Found");
            ApiError::not_found("route not found")
        })
        .with_state(state)
        .layer(create_cors_layer())
        .layer(TraceLayer::new_for_http())
}

fn create_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
