use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::store::StoreError;

/// Failures that abort an operation. Expected business outcomes
/// (seat taken, ticket already cancelled) are returned as values instead.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("storage failure: {0}")]
    Infrastructure(#[from] StoreError),
}

pub type BookingResult<T> = Result<T, BookingError>;

impl BookingError {
    pub fn not_found(message: impl Into<String>) -> Self {
        BookingError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        BookingError::Conflict(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        BookingError::Validation(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        BookingError::Unauthorized(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            BookingError::NotFound(_) => StatusCode::NOT_FOUND,
            BookingError::Conflict(_) => StatusCode::CONFLICT,
            BookingError::Validation(_) => StatusCode::BAD_REQUEST,
            BookingError::Unauthorized(_) => StatusCode::FORBIDDEN,
            BookingError::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
pub struct ApiError {
    pub success: bool,
    pub message: String,
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            BookingError::Infrastructure(e) => {
                tracing::error!("infrastructure fault: {:?}", e);
                "Something went wrong, please try again later".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(ApiError { success: false, message })).into_response()
    }
}
