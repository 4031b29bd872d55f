use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde::Serialize;
use sqlparser::parser::ParserError;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("error parsing sql: {0}")]
    Parse(#[from] ParserError),

    #[error("store error: {0:#}")]
    Store(anyhow::Error),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ServiceError::InvalidRequest(message.into())
    }

    /// True for errors caused by the caller's input rather than by the service.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ServiceError::InvalidRequest(_) | ServiceError::Parse(_)
        )
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::Store(err.into())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::InvalidRequest(_) | ServiceError::Parse(_) => StatusCode::BAD_REQUEST,
            ServiceError::Store(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if !self.is_user_error() {
            error!(error = %self, "request failed");
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_user_errors_to_bad_request() {
        let response = ServiceError::invalid("invalid cursor").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ServiceError::Store(anyhow::anyhow!("connection reset")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = ServiceError::Cancelled.into_response();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn store_errors_keep_the_originating_cause() {
        let err = ServiceError::Store(
            anyhow::anyhow!("Code: 60. Table default.nope does not exist")
                .context("clickhouse returned 404"),
        );
        let message = err.to_string();
        assert!(message.contains("clickhouse returned 404"), "{message}");
        assert!(message.contains("Code: 60"), "{message}");
    }
}
