//! Error type shared by every handler and its JSON response shape.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::ingest::IngestError;
use crate::store::StoreError;

/// Machine-readable error codes carried in every error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    ValidationError,
    NotFound,
    StorageUnavailable,
    InternalError,
}

impl ApiErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            ApiErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error returned by every handler, rendered as `{success:false, error, code}`.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{error}")]
pub struct ApiError {
    pub success: bool,
    pub error: String,
    pub code: ApiErrorCode,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(code: ApiErrorCode, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            code,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::ValidationError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::StorageUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::InternalError, message)
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match &err {
            IngestError::Validation(msg) => ApiError::invalid_input(msg.clone()),
            IngestError::NotFound(_) => ApiError::not_found(err.to_string()),
            IngestError::StorageUnavailable(_) => ApiError::unavailable(err.to_string()),
            IngestError::Internal(_) => ApiError::internal(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        IngestError::from(err).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::invalid_input(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::invalid_input(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = ?self.code, error = %self.error, "Request failed");
        }
        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_errors_map_to_status() {
        let cases = [
            (IngestError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (IngestError::NotFound("s9".into()), StatusCode::NOT_FOUND),
            (IngestError::StorageUnavailable("down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (IngestError::Internal("oops".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_error_body_shape() {
        let body = serde_json::to_value(ApiError::invalid_input("valor requerido")).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"success": false, "error": "valor requerido", "code": "VALIDATION_ERROR"})
        );
    }
}
