//! `/lecturas` endpoints: submit and query readings.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::ingest::{ListQuery, Pagination, ReadingStats};
use crate::reading::{NewReading, Reading, ReadingKind};
use crate::store::ReadingFilter;

#[derive(Debug, Serialize)]
pub struct ReadingCreated {
    pub success: bool,
    pub data: Reading,
}

#[derive(Debug, Deserialize)]
pub struct LatestParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestReadings {
    pub success: bool,
    pub sensor_id: String,
    pub count: usize,
    pub data: Vec<Reading>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub sensor_id: Option<String>,
    pub tipo: Option<String>,
    pub fecha_inicio: Option<String>,
    pub fecha_fin: Option<String>,
    pub limit: Option<usize>,
    pub page: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ReadingList {
    pub data: Vec<Reading>,
    pub pagination: Pagination,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsParams {
    pub sensor_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub success: bool,
    pub data: Vec<ReadingStats>,
}

/// `POST /lecturas`
pub async fn create_reading(
    State(state): State<AppState>,
    body: Result<Json<NewReading>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ReadingCreated>)> {
    let Json(submission) = body?;
    let stored = state.ingestor.ingest(submission).await?;

    Ok((
        StatusCode::CREATED,
        Json(ReadingCreated {
            success: true,
            data: stored,
        }),
    ))
}

/// `GET /lecturas/ultimas/:sensor_id`
pub async fn latest_readings(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
    params: Result<Query<LatestParams>, QueryRejection>,
) -> ApiResult<Json<LatestReadings>> {
    let Query(params) = params?;
    let data = state.ingestor.latest(&sensor_id, params.limit).await?;

    Ok(Json(LatestReadings {
        success: true,
        sensor_id,
        count: data.len(),
        data,
    }))
}

/// `GET /lecturas`
pub async fn list_readings(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Json<ReadingList>> {
    let Query(params) = params?;
    let query = to_list_query(params)?;
    let page = state.ingestor.list(query).await?;

    Ok(Json(ReadingList {
        data: page.data,
        pagination: page.pagination,
    }))
}

/// `GET /lecturas/estadisticas`
pub async fn reading_statistics(
    State(state): State<AppState>,
    params: Result<Query<StatsParams>, QueryRejection>,
) -> ApiResult<Json<StatsResponse>> {
    let Query(params) = params?;
    let sensor_id = params.sensor_id.filter(|id| !id.is_empty());
    let data = state.ingestor.statistics(sensor_id.as_deref()).await?;

    Ok(Json(StatsResponse { success: true, data }))
}

fn to_list_query(params: ListParams) -> ApiResult<ListQuery> {
    let tipo = match params.tipo.as_deref().filter(|t| !t.is_empty()) {
        Some(raw) => Some(
            ReadingKind::parse(raw)
                .ok_or_else(|| ApiError::invalid_input(format!("tipo '{}' is not temperatura or humedad", raw)))?,
        ),
        None => None,
    };

    let from = params
        .fecha_inicio
        .as_deref()
        .filter(|d| !d.is_empty())
        .map(|d| parse_date_param("fechaInicio", d, false))
        .transpose()?;
    let to = params
        .fecha_fin
        .as_deref()
        .filter(|d| !d.is_empty())
        .map(|d| parse_date_param("fechaFin", d, true))
        .transpose()?;

    Ok(ListQuery {
        filter: ReadingFilter {
            sensor_id: params.sensor_id.filter(|id| !id.is_empty()),
            tipo,
            from,
            to,
        },
        page: params.page,
        limit: params.limit,
    })
}

/// Accepts RFC 3339 timestamps or bare `YYYY-MM-DD` dates.
///
/// A bare date means the start of that day, or its last instant when it
/// closes a range.
fn parse_date_param(name: &str, value: &str, end_of_day: bool) -> ApiResult<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| ApiError::invalid_input(format!("{} '{}' is not a valid date", name, value)))?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };

    time.map(|t| t.and_utc())
        .ok_or_else(|| ApiError::invalid_input(format!("{} '{}' is not a valid date", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_date_param_formats() {
        let rfc = parse_date_param("fechaInicio", "2024-05-01T10:30:00+02:00", false).unwrap();
        assert_eq!(rfc, Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap());

        let start = parse_date_param("fechaInicio", "2024-05-01", false).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());

        let end = parse_date_param("fechaFin", "2024-05-01", true).unwrap();
        assert!(end > Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 59).unwrap());

        assert!(parse_date_param("fechaFin", "yesterday", true).is_err());
    }

    #[test]
    fn test_list_params_translate_to_filter() {
        let query = to_list_query(ListParams {
            sensor_id: Some("s1".to_string()),
            tipo: Some("Humedad".to_string()),
            page: Some(2),
            ..ListParams::default()
        })
        .unwrap();

        assert_eq!(query.filter.sensor_id.as_deref(), Some("s1"));
        assert_eq!(query.filter.tipo, Some(ReadingKind::Humidity));
        assert_eq!(query.page, Some(2));
        assert!(query.limit.is_none());
    }

    #[test]
    fn test_unknown_tipo_rejected() {
        let err = to_list_query(ListParams {
            tipo: Some("presion".to_string()),
            ..ListParams::default()
        })
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
