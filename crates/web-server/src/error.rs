use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use database::DbError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Database(DbError::DuplicateKey(_)) => (
                StatusCode::CONFLICT,
                "already_exists",
                "record already exists".to_string(),
            ),
            AppError::Database(DbError::EngineUnavailable) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                "database is not available".to_string(),
            ),
            AppError::Database(DbError::InvalidStatement(msg)) => {
                (StatusCode::BAD_REQUEST, "bad_request", msg.clone())
            }
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "An internal database error occurred".to_string(),
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
        }
    }
}

/// Converts our custom `AppError` into the `{status, code, msg}` envelope.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, msg) = self.parts();
        if status.is_server_error() {
            tracing::error!(r#type = "api_request", code, err = %self, "Request failed.");
        } else {
            tracing::debug!(r#type = "api_request", code, err = %self, "Request rejected.");
        }

        let body = Json(json!({ "status": false, "code": code, "msg": msg }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CapturedLogs;

    #[test]
    fn duplicate_key_maps_to_conflict() {
        let err = AppError::from(DbError::DuplicateKey(sqlx::Error::RowNotFound));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn unavailable_engine_maps_to_503() {
        let err = AppError::from(DbError::EngineUnavailable);
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn server_errors_are_logged_as_api_requests() {
        let (logs, _guard) = CapturedLogs::install();
        let err = AppError::from(DbError::EngineUnavailable);
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);

        let output = logs.contents();
        assert!(output.contains(r#""type":"api_request""#), "{output}");
        assert!(output.contains(r#""code":"service_unavailable""#), "{output}");
    }

    #[test]
    fn unclassified_failures_are_generic_500s() {
        let err = AppError::from(DbError::Unclassified {
            context: "insert into subscribers".to_string(),
            source: sqlx::Error::PoolTimedOut,
        });
        let (status, code, msg) = err.parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(code, "server_error");
        assert!(!msg.contains("subscribers"));
    }
}
