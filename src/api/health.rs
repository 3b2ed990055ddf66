//! `/health` endpoint: liveness plus storage and simulation summary.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use super::AppState;
use crate::store::ReadingFilter;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub success: bool,
    pub status: &'static str,
    pub sensores: usize,
    pub lecturas: u64,
    pub simulaciones_activas: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /health`: 200 when storage answers, 503 otherwise.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let simulaciones_activas = state.controller.active_count();
    let sensores = state.sensors.list().await.map(|s| s.len());
    let lecturas = state.ingestor.store().count(&ReadingFilter::default()).await;

    match (sensores, lecturas) {
        (Ok(sensores), Ok(lecturas)) => (
            StatusCode::OK,
            Json(HealthResponse {
                success: true,
                status: "ok",
                sensores,
                lecturas,
                simulaciones_activas,
                timestamp: Utc::now(),
                error: None,
            }),
        ),
        (sensores, lecturas) => {
            let error = [sensores.err(), lecturas.err()]
                .into_iter()
                .flatten()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            warn!(error = %error, "Health check failed");

            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    success: false,
                    status: "unavailable",
                    sensores: 0,
                    lecturas: 0,
                    simulaciones_activas,
                    timestamp: Utc::now(),
                    error: Some(error),
                }),
            )
        }
    }
}
