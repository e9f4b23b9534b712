//! HTTP mapping for [`ReproError`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use repro_core::ReproError;
use serde::Serialize;

/// JSON error body: `{"error": {"code": "E_...", "message": "..."}}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Wraps a core error so handlers can return `Result<_, ApiError>`.
#[derive(Debug)]
pub struct ApiError(pub ReproError);

impl From<ReproError> for ApiError {
    fn from(e: ReproError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(event = "api.error", code = self.0.code(), error = %self.0);
        } else {
            tracing::debug!(event = "api.error", code = self.0.code(), error = %self.0);
        }
        let body = serde_json::json!({
            "error": ErrorBody {
                code: self.0.code(),
                message: self.0.public_message(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repro_core::queue::QueueError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ReproError::not_found("experiment"), StatusCode::NOT_FOUND),
            (
                ReproError::from(QueueError::Unavailable("full".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ReproError::PayloadTooLarge { limit: 1 },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                ReproError::storage("disk"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }
}
