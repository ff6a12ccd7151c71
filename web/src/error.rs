//! HTTP error envelope.
//!
//! Every failure leaves the ingress as
//! `{"success": false, "error": {"code": "...", "message": "...",
//! "details": "..."}}` with a stable UPPER_SNAKE code. Domain errors map
//! through [`rushtix_core::ErrorCode`]; nothing below the handlers knows
//! about HTTP.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rushtix_core::{DomainError, ErrorCode};
use serde::Serialize;
use std::fmt;

/// Application error carried to the response boundary.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
    details: Option<String>,
    source: Option<anyhow::Error>,
}

impl ApiError {
    /// Build an error from a taxonomy code.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(code.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: code.as_str().to_string(),
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Attach client-visible details.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Attach an internal cause (logged, never sent to the client).
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// 400 with a validation code.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// 401 missing credentials.
    #[must_use]
    pub fn missing_token() -> Self {
        Self::new(ErrorCode::MissingToken, "missing bearer token")
    }

    /// 401 bad credentials.
    #[must_use]
    pub fn invalid_token() -> Self {
        Self::new(ErrorCode::InvalidToken, "invalid or expired token")
    }

    /// 403.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// 429 with the standard message.
    #[must_use]
    pub fn too_many_requests() -> Self {
        Self::new(ErrorCode::TooManyRequests, "rate limit exceeded")
    }

    /// 500 with a generic message; the cause stays in the logs.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// The HTTP status this error renders as.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// The stable wire code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        let code = err.code();
        let mut api = Self::new(code, err.to_string());
        // Internal causes are not client-facing; replace the message.
        if code == ErrorCode::InternalError {
            api.message = "an internal error occurred".to_string();
            api.source = Some(anyhow::Error::new(err));
        }
        api
    }
}

/// The `error` object inside the envelope.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// The full envelope.
#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            if let Some(source) = &self.source {
                tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    error = %source,
                    "request failed"
                );
            } else {
                tracing::error!(status = %self.status, code = %self.code, message = %self.message, "request failed");
            }
        }
        metrics::counter!("http.errors", "code" => self.code.clone()).increment(1);

        let body = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };

        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_spec_statuses() {
        let err = ApiError::from(DomainError::InsufficientSeats);
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "INSUFFICIENT_SEATS");

        let err = ApiError::from(DomainError::Forbidden);
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn internal_errors_do_not_leak() {
        let err = ApiError::from(DomainError::Storage("password=hunter2".to_string()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("hunter2"));
    }

    #[test]
    fn display_includes_code() {
        let err = ApiError::too_many_requests();
        assert_eq!(err.to_string(), "[TOO_MANY_REQUESTS] rate limit exceeded");
    }
}
