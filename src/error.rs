use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors surfaced by the user and moderation services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    /// A required dependency (store, object storage) failed.
    #[error("upstream failure: {0:#}")]
    Upstream(#[source] anyhow::Error),

    #[error("internal error: {0:#}")]
    Internal(#[source] anyhow::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::InvalidInput(_) => "INVALID_INPUT",
            ServiceError::Unauthorized(_) => "UNAUTHORIZED",
            ServiceError::Forbidden(_) => "FORBIDDEN",
            ServiceError::Conflict(_) => "CONFLICT",
            ServiceError::Upstream(_) => "UPSTREAM_ERROR",
            ServiceError::Internal(_) => "SERVER_ERROR",
        }
    }

    /// Message safe to hand back to clients; dependency details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            ServiceError::Upstream(_) => "A dependency failed, try again later".into(),
            ServiceError::Internal(_) => "Internal server error".into(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub status: &'static str,
    pub message: String,
}

impl MessageResponse {
    pub fn success(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "success",
            message: message.into(),
        })
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, code = self.code(), "request failed");
        }
        let body = ErrorBody {
            status: "error",
            code: self.code(),
            message: self.public_message(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ServiceError> for tonic::Status {
    fn from(err: ServiceError) -> Self {
        match &err {
            ServiceError::NotFound(m) => tonic::Status::not_found(m.clone()),
            ServiceError::InvalidInput(m) => tonic::Status::invalid_argument(m.clone()),
            ServiceError::Unauthorized(m) => tonic::Status::unauthenticated(m.clone()),
            ServiceError::Forbidden(m) => tonic::Status::permission_denied(m.clone()),
            ServiceError::Conflict(m) => tonic::Status::already_exists(m.clone()),
            ServiceError::Upstream(_) => {
                error!(error = %err, "grpc upstream failure");
                tonic::Status::unavailable(err.public_message())
            }
            ServiceError::Internal(_) => {
                error!(error = %err, "grpc internal failure");
                tonic::Status::internal(err.public_message())
            }
        }
    }
}
