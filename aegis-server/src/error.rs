//! API error handling module
//!
//! Every failure leaves the server as `{"status":"KO","message":...,"code":...}`.
//! Ceremony failures only expose their class; the cause is logged.

use aegis_core::{CeremonyError, Outcome};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// Generic registration failure shown to the user
pub const REGISTRATION_FAILED: &str = "Unable to register your security key.";
/// Generic authentication failure shown to the user
pub const AUTHENTICATION_FAILED: &str = "Authentication failed, please retry later.";
/// Generic credential management failure shown to the user
pub const MANAGEMENT_FAILED: &str = "Unable to update your security keys.";

/// Which user-facing operation a ceremony error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Registration,
    Authentication,
    Management,
}

impl Operation {
    fn message(&self) -> &'static str {
        match self {
            Self::Registration => REGISTRATION_FAILED,
            Self::Authentication => AUTHENTICATION_FAILED,
            Self::Management => MANAGEMENT_FAILED,
        }
    }

    /// Settle a ceremony result: the success payload, or a failure carrying
    /// the status of its outcome class.
    pub fn settle<T>(self, result: Result<T, CeremonyError>) -> Result<T, ApiError> {
        let (status, source) = match Outcome::from(result) {
            Outcome::Success(value) => return Ok(value),
            Outcome::BadRequest(source) => (StatusCode::BAD_REQUEST, source),
            Outcome::Forbidden(source) => (StatusCode::FORBIDDEN, source),
            Outcome::Conflict(source) => (StatusCode::CONFLICT, source),
        };
        Err(ApiError::Ceremony {
            operation: self,
            status,
            source,
        })
    }
}

/// Failure body
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Always "KO"
    #[schema(example = "KO")]
    pub status: &'static str,
    #[schema(example = "Authentication failed, please retry later.")]
    pub message: String,
    #[schema(example = "FORBIDDEN")]
    pub code: &'static str,
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad request - client provided invalid input
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Ceremony failure, reported by class only
    #[error("{operation:?} failed: {source}")]
    Ceremony {
        operation: Operation,
        status: StatusCode,
        source: CeremonyError,
    },
}

impl ApiError {
    /// Create a bad request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Ceremony { status, .. } => *status,
        }
    }

    /// Get the error code for programmatic error handling
    fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "INVALID_INPUT",
            Self::Ceremony { status, .. } => match *status {
                StatusCode::CONFLICT => "CONFLICT",
                StatusCode::FORBIDDEN => "FORBIDDEN",
                _ => "INVALID_INPUT",
            },
        }
    }

    /// Get sanitized error message for client response
    fn client_message(&self) -> String {
        match self {
            Self::Ceremony { operation, .. } => operation.message().to_string(),
            Self::BadRequest(_) => self.to_string(),
        }
    }

    /// Get the error category for logging
    fn error_category(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Ceremony { .. } => "ceremony",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let category = self.error_category();
        let code = self.error_code();
        let internal_message = self.to_string();

        // Ceremony causes are logged in detail by the orchestrator
        match &self {
            Self::Ceremony {
                source: CeremonyError::Storage(_) | CeremonyError::Session(_),
                ..
            } => {
                tracing::error!(
                    status = %status,
                    category = category,
                    code = code,
                    error = %internal_message,
                    "Server error"
                );
            }
            _ => {
                tracing::debug!(
                    status = %status,
                    category = category,
                    code = code,
                    error = %internal_message,
                    "Client error"
                );
            }
        }

        let body = ErrorBody {
            status: "KO",
            message: self.client_message(),
            code,
        };

        (status, Json(body)).into_response()
    }
}
