use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use murmur_types::ChatError;
use murmur_types::api::ErrorResponse;

/// HTTP face of a rejected operation: a status code plus a readable reason.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub reason: String,
}

impl ApiError {
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, reason)
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, reason)
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        let status = match &err {
            ChatError::Validation(_) | ChatError::InvalidRecipient(_) => StatusCode::BAD_REQUEST,
            ChatError::Auth(_) => StatusCode::UNAUTHORIZED,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            // Already logged where it happened; keep internals out of the response
            ChatError::Storage(_) => return Self::internal(),
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.reason })).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
