use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chatgate_contracts::ErrorResponse;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    TooManyRequests(String),
    #[error("{0}")]
    Upstream(String),
    #[error("Server configuration error")]
    Misconfigured(String),
    #[error("Internal server error")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized(msg) => {
                warn!(msg = %msg, "auth failure");
                StatusCode::UNAUTHORIZED
            }
            Self::BadRequest(msg) => {
                info!(msg = %msg, "bad request");
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(msg) => {
                info!(msg = %msg, "not found");
                StatusCode::NOT_FOUND
            }
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(msg) => {
                error!(msg = %msg, "completion provider error");
                StatusCode::BAD_GATEWAY
            }
            Self::Misconfigured(msg) => {
                error!(msg = %msg, "server misconfigured");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Internal(msg) => {
                error!(msg = %msg, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
