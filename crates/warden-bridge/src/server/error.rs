//! Server-side errors and their HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::backend::BackendError;
use crate::protocol::ErrorBody;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unknown handle: {0}")]
    ContainerNotFound(String),

    #[error("unknown stream: {0}")]
    UnknownStream(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Backend(BackendError),
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::ContainerNotFound(handle) => Self::ContainerNotFound(handle),
            other => Self::Backend(other),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ContainerNotFound(_)
            | Self::UnknownStream(_)
            | Self::Backend(BackendError::ProcessNotFound(_)) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) | Self::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let handle = match &self {
            Self::ContainerNotFound(handle) => Some(handle.clone()),
            _ => None,
        };
        if status.is_server_error() {
            tracing::warn!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, %status, "Request rejected");
        }
        let body = ErrorBody {
            message: self.to_string(),
            handle,
        };
        (status, Json(body)).into_response()
    }
}
