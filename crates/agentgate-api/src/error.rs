//! HTTP error mapping

use agentgate_control::{ControlError, TunnelError};
use agentgate_relay_db::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::Json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::models::{Response, ValidationError};

/// An error rendered as a JSON [`Response`]
#[derive(Debug, Error)]
#[error("{status}: {}", .response.message)]
pub struct ApiError {
    pub status: StatusCode,
    pub response: Response,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            response: Response::new(message),
        }
    }

    pub fn with_detail(mut self, detail: impl ToString) -> Self {
        self.response.detail = detail.to_string();
        self
    }

    /// Intentionally vague so responses do not reveal which resources exist
    pub fn not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "Resource not found or you do not have access to this resource",
        )
    }

    pub fn validation(message: impl Into<String>, field: &str, detail: &str) -> Self {
        let mut err = Self::new(StatusCode::BAD_REQUEST, message);
        err.response.validations.push(ValidationError {
            field: field.to_string(),
            detail: detail.to_string(),
        });
        err
    }

    pub fn shutting_down() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down.")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> AxumResponse {
        if self.status.is_server_error() {
            error!(status = %self.status, detail = %self.response.detail, "{}", self.response.message);
        }
        (self.status, Json(self.response)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::not_found(),
            e => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error fetching workspace agent.")
                .with_detail(e),
        }
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::OutdatedBuild { .. } => ApiError::new(
                StatusCode::FORBIDDEN,
                "Agent trying to connect from non-latest build.",
            )
            .with_detail(err),
            ControlError::Store(e) => e.into(),
            ControlError::InvalidAgent(detail) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error reading workspace agent.")
                    .with_detail(detail)
            }
            e => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error.").with_detail(e),
        }
    }
}

impl From<TunnelError> for ApiError {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::AgentNotConnected(_) => {
                ApiError::new(StatusCode::PRECONDITION_FAILED, err.to_string())
            }
            TunnelError::Store(e) => e.into(),
            e => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to dial workspace agent.")
                .with_detail(e),
        }
    }
}

/// Parse an id from a path segment or query parameter
pub fn parse_uuid(field: &str, value: Option<&str>) -> ApiResult<Uuid> {
    let value = value.unwrap_or_default();
    Uuid::parse_str(value).map_err(|_| {
        ApiError::validation(
            format!("Param '{}' must be a valid UUID.", field),
            field,
            "invalid UUID",
        )
    })
}
