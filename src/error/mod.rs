//! Error taxonomy for the realtime core.
//!
//! Transport failures and bus unavailability are deliberately absorbed on
//! the fan-out paths (implicit disconnect / local-only degradation), so
//! the variants here are the ones that surface on the admin API and at
//! component boundaries. Each maps to an HTTP status plus a stable
//! machine-readable code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Capacity exceeded: {current}/{max} connections")]
    CapacityExceeded { current: usize, max: usize },
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "UNAUTHORIZED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let message = self.to_string();

        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %message,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_code_mapping() {
        let cases = [
            (
                AppError::Auth("bad token".into()),
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
            ),
            (
                AppError::Validation("empty name".into()),
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
            ),
            (
                AppError::NotFound("rule x".into()),
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
            ),
            (
                AppError::CapacityExceeded { current: 10, max: 10 },
                StatusCode::SERVICE_UNAVAILABLE,
                "CAPACITY_EXCEEDED",
            ),
        ];

        for (err, status, code) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_capacity_message_names_the_limits() {
        let err = AppError::CapacityExceeded { current: 7, max: 5 };
        assert_eq!(err.to_string(), "Capacity exceeded: 7/5 connections");
    }
}
