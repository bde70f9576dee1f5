//! Error handling for lotwatch

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error (malformed detection, degenerate geometry, bad request)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Capture source error (open/read failure)
    #[error("Capture error: {0}")]
    Capture(String),

    /// Classifier error (inference failed or timed out)
    #[error("Inference error: {0}")]
    Inference(String),

    /// Publisher error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// SQLx database error
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl Error {
    /// Stable reason code reported to API clients and logs
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Database(_) | Error::Sqlx(_) => "DATABASE_ERROR",
            Error::Capture(_) => "CAPTURE_ERROR",
            Error::Inference(_) => "INFERENCE_ERROR",
            Error::Publish(_) => "PUBLISH_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Capture(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Inference(_) | Error::Http(_) => StatusCode::BAD_GATEWAY,
            Error::Database(_)
            | Error::Sqlx(_)
            | Error::Publish(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Config(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_code = self.code();
        let message = self.to_string();

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::NotFound("cam".into()).code(), "NOT_FOUND");
        assert_eq!(Error::Capture("eof".into()).code(), "CAPTURE_ERROR");
        assert_eq!(Error::Database("down".into()).code(), "DATABASE_ERROR");
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(Error::Validation("bbox".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::Inference("timeout".into()).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            Error::Capture("no frame".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
