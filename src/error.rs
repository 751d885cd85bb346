//! Error types for the sheet gateway

use std::io;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the sheet gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Sheet gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file or environment could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Client exceeded its request quota
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the client's window frees a slot
        retry_after_secs: u64,
    },

    /// Required request parameter missing or malformed
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Upstream credentials or dataset identifier absent
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Upstream could not be reached (connect, timeout, body read)
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream answered with a non-success status
    #[error("Upstream rejected request with HTTP {status}: {message}")]
    UpstreamRejected {
        /// Upstream HTTP status code
        status: u16,
        /// Upstream error message, if any
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Offline cache controller failure
    #[error(transparent)]
    Worker(#[from] crate::worker::WorkerError),

    /// Anything unclassified
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status the router answers with for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamRejected { status: 404, .. } => StatusCode::NOT_FOUND,
            Self::UpstreamRejected {
                status: 401 | 403, ..
            } => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code carried in the `details` field
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::ValidationFailed(_) => "missing_parameter",
            Self::ConfigurationMissing(_) | Self::Config(_) => "configuration_missing",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamRejected { status: 404, .. } => "not_found",
            Self::UpstreamRejected {
                status: 401 | 403, ..
            } => "permission_denied",
            Self::UpstreamRejected { .. } => "upstream_error",
            Self::Io(_) | Self::Json(_) | Self::Worker(_) | Self::Internal(_) => "internal",
        }
    }

    /// Human-readable message shown to end users
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "Too many requests. Please wait a moment and try again.",
            Self::ValidationFailed(_) => "Specify either action=list or a sheet name.",
            Self::ConfigurationMissing(_) | Self::Config(_) => {
                "The server is not configured to reach the spreadsheet."
            }
            Self::UpstreamUnavailable(_) => {
                "Could not reach the spreadsheet service. Please try again later."
            }
            Self::UpstreamRejected { status: 404, .. } => "The requested sheet was not found.",
            Self::UpstreamRejected {
                status: 401 | 403, ..
            } => "Access to the spreadsheet was denied.",
            Self::UpstreamRejected { .. } => "The spreadsheet service returned an error.",
            Self::Io(_) | Self::Json(_) | Self::Worker(_) | Self::Internal(_) => {
                "An unexpected error occurred."
            }
        }
    }

    /// Whether retrying the same request later may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::UpstreamUnavailable(_)
        ) || matches!(self, Self::UpstreamRejected { status, .. } if *status >= 500)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.user_message(),
            "details": self.code(),
            "offline": matches!(self, Self::UpstreamUnavailable(_)),
        });
        if let Self::UpstreamRejected { status, .. } = &self {
            body["upstream_status"] = json!(status);
        }

        let mut response = (self.status_code(), Json(body)).into_response();
        if let Self::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
