//! HTTP error mapping for the admin routes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::domains::scheduler::SchedulerError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid run token")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Scheduler lifecycle errors become 409; everything else is a 500.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<SchedulerError>() {
            Some(e @ (SchedulerError::AlreadyRunning | SchedulerError::NotRunning)) => {
                ApiError::Conflict(e.to_string())
            }
            _ => ApiError::Internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(e) => {
                error!(error = %format!("{:#}", e), "request failed");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_lifecycle_errors_are_conflicts() {
        let err: ApiError = anyhow::Error::from(SchedulerError::AlreadyRunning).into();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err: ApiError = anyhow::Error::from(SchedulerError::NotRunning).into();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err: ApiError = anyhow::anyhow!("db down").into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
