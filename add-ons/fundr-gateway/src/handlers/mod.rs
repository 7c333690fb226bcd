//! HTTP handlers, one module per resource.

pub(crate) mod chat;
pub(crate) mod credits;
pub(crate) mod projects;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use fundr_core::{CreditError, EngineError, StoreError};

/// Error body returned by every handler: `{ "error": "..." }`.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(error: &dyn std::fmt::Display) -> Self {
        tracing::error!(target: "fundr::gateway", error = %error, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::MergeConflict { .. } => Self {
                status: StatusCode::CONFLICT,
                message: "profile is being updated, try again".to_string(),
            },
            other => Self::internal(&other),
        }
    }
}

impl From<CreditError> for ApiError {
    fn from(e: CreditError) -> Self {
        match e {
            CreditError::UnknownReservation(id) => Self::not_found(format!("unknown reservation {}", id)),
            other => Self::internal(&other),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::internal(&e)
    }
}

pub(crate) fn require(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{} is required", field)));
    }
    Ok(())
}
