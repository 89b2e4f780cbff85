use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::core::storage::GatewayError;

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    retryable: bool,
}

/// HTTP view of a `GatewayError`. The message is the user-facing text, never
/// the provider detail.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let (status, code) = match &err {
            GatewayError::AuthExpired(_) => (StatusCode::UNAUTHORIZED, "reconnect_required"),
            GatewayError::UnsupportedFormat(_) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_format")
            }
            GatewayError::InvalidState(_) => (StatusCode::BAD_REQUEST, "invalid_state"),
            GatewayError::ConnectionNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            GatewayError::InvalidRequest(_) | GatewayError::ProviderNotConfigured(_) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            GatewayError::ProviderUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable")
            }
            GatewayError::UploadFailed(_) => (StatusCode::BAD_GATEWAY, "upload_failed"),
            GatewayError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        if status.is_server_error() {
            tracing::error!(code, error = %err, "Request failed");
        } else {
            tracing::debug!(code, error = %err, "Request rejected");
        }

        Self {
            status,
            code,
            message: err.user_message(),
            retryable: err.is_retryable(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                retryable: self.retryable,
            },
        };
        (self.status, Json(body)).into_response()
    }
}
