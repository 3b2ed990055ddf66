//! `/simulador` endpoints: control of per-sensor simulation jobs.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::controller::SensorOutcome;
use crate::ingest::SensorCheck;
use crate::reading::{Reading, Sensor};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRequest {
    #[serde(default)]
    pub sensor_id: Option<String>,
}

impl SensorRequest {
    fn require_id(self) -> ApiResult<String> {
        self.sensor_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::invalid_input("sensorId is required"))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub success: bool,
    pub message: String,
    pub sensor_id: String,
}

#[derive(Debug, Serialize)]
pub struct BatchStartResponse {
    pub success: bool,
    pub message: String,
    pub total: usize,
    pub iniciados: usize,
    pub resultados: Vec<SensorOutcome>,
}

#[derive(Debug, Serialize)]
pub struct StopAllResponse {
    pub success: bool,
    pub message: String,
    pub detenidos: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    pub sensor_id: String,
    pub activo: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedSensor {
    #[serde(flatten)]
    pub sensor: Sensor,
    pub simulador_activo: bool,
}

#[derive(Debug, Serialize)]
pub struct SensorListResponse {
    pub success: bool,
    pub count: usize,
    pub data: Vec<SimulatedSensor>,
}

#[derive(Debug, Serialize)]
pub struct TestReadingResponse {
    pub success: bool,
    pub data: Reading,
}

/// `POST /simulador/iniciar`
pub async fn start_simulation(
    State(state): State<AppState>,
    body: Result<Json<SensorRequest>, JsonRejection>,
) -> ApiResult<Json<JobResponse>> {
    let Json(request) = body?;
    let sensor_id = request.require_id()?;

    state.controller.start(&sensor_id).await?;

    Ok(Json(JobResponse {
        success: true,
        message: format!("Simulation started for sensor {}", sensor_id),
        sensor_id,
    }))
}

/// `POST /simulador/detener`
pub async fn stop_simulation(
    State(state): State<AppState>,
    body: Result<Json<SensorRequest>, JsonRejection>,
) -> ApiResult<Json<JobResponse>> {
    let Json(request) = body?;
    let sensor_id = request.require_id()?;

    let outcome = state.controller.stop(&sensor_id).await;
    let message = if !outcome.was_running {
        format!("Sensor {} had no running simulation", sensor_id)
    } else if outcome.timed_out {
        format!("Simulation for sensor {} cancelled; loop still winding down", sensor_id)
    } else {
        format!("Simulation stopped for sensor {}", sensor_id)
    };

    Ok(Json(JobResponse {
        success: true,
        message,
        sensor_id,
    }))
}

/// `POST /simulador/iniciar-todos`
pub async fn start_all(State(state): State<AppState>) -> ApiResult<Json<BatchStartResponse>> {
    let report = state.controller.start_all_active_sensors().await?;

    if report.total == 0 {
        return Err(ApiError::not_found("No active sensors to simulate"));
    }

    Ok(Json(BatchStartResponse {
        success: true,
        message: format!("Started {} of {} simulations", report.succeeded, report.total),
        total: report.total,
        iniciados: report.succeeded,
        resultados: report.results,
    }))
}

/// `POST /simulador/detener-todos`
pub async fn stop_all(State(state): State<AppState>) -> Json<StopAllResponse> {
    let stopped = state.controller.stop_all().await;

    Json(StopAllResponse {
        success: true,
        message: format!("Stopped {} simulations", stopped),
        detenidos: stopped,
    })
}

/// `GET /simulador/estado/:sensor_id`
pub async fn simulation_status(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
) -> Json<StatusResponse> {
    let status = state.controller.status(&sensor_id);

    Json(StatusResponse {
        success: true,
        sensor_id,
        activo: status.active,
    })
}

/// `GET /simulador/sensores`
pub async fn list_sensors(State(state): State<AppState>) -> ApiResult<Json<SensorListResponse>> {
    let sensors = state.sensors.find_active().await?;

    let data: Vec<SimulatedSensor> = sensors
        .into_iter()
        .map(|sensor| SimulatedSensor {
            simulador_activo: state.controller.status(&sensor.id).active,
            sensor,
        })
        .collect();

    Ok(Json(SensorListResponse {
        success: true,
        count: data.len(),
        data,
    }))
}

/// `POST /simulador/test-lectura/:sensor_id`
///
/// Generates and stores a single reading without starting a job.
pub async fn test_reading(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
) -> ApiResult<(StatusCode, Json<TestReadingResponse>)> {
    let sensor = state
        .sensors
        .find_by_id(&sensor_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("sensor '{}' not found", sensor_id)))?;

    let submission = state.controller.generator().generate_for(&sensor);
    let stored = state.ingestor.ingest_with(submission, SensorCheck::Exists).await?;
    info!(sensor_id = %sensor_id, tipo = %stored.tipo, valor = stored.valor, "Test reading stored");

    Ok((
        StatusCode::CREATED,
        Json(TestReadingResponse {
            success: true,
            data: stored,
        }),
    ))
}
