//! # Error Handling
//!
//! This module defines the error types used by the relay and how they reach clients.
//!
//! There are two families of errors, and they travel by different roads:
//!
//! - **`AppError`**: anything that goes wrong *before* a processing session starts
//!   (bad upload, a session already running, a second event subscriber). These are
//!   returned straight to the HTTP caller as JSON error responses.
//! - **`SessionError`**: anything that goes wrong *inside* a running session
//!   (engine missing, inference failure, speech provider failure). The upload call
//!   has already answered `processing` by then, so these are only ever observable as
//!   the terminal `error` event on the event stream.
//!
//! ## Key Rust Concepts for Error Handling:
//! - **Enums for Error Types**: Each variant represents a different kind of failure
//! - **From trait**: Automatically converts between error types with `?`
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **Display trait**: Defines how errors are formatted as strings

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Errors surfaced synchronously to HTTP callers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent malformed data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Upload failed validation rules (400 errors)
/// - **SessionBusy**: Another upload is still being processed (409 errors)
/// - **SubscriberActive**: The event stream already has a reader (409 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Upload input failed validation rules
    ValidationError(String),

    /// A processing session is already in flight
    SessionBusy(String),

    /// Another client is already draining the event stream
    SubscriberActive,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::SessionBusy(id) => write!(f, "Session busy: session {} is still processing", id),
            AppError::SubscriberActive => write!(f, "Event stream already has an active subscriber"),
        }
    }
}

impl std::error::Error for AppError {}

/// Implementation of the ResponseError trait for AppError.
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "session_busy",
///     "message": "Session busy: session 6f1c... is still processing",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::SessionBusy(_) | AppError::SubscriberActive => StatusCode::CONFLICT,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let error_type = match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::SessionBusy(_) => "session_busy",
            AppError::SubscriberActive => "subscriber_active",
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// When you use `?` with an anyhow::Error, it automatically becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// A broken multipart body is a malformed request.
impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Multipart error: {}", err))
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;

/// Failures that end a running session.
///
/// ## Propagation:
/// These never reach an HTTP response. The orchestrator's supervisor renders
/// exactly one of them into the terminal `error` event for the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// No inference engine has been installed
    EngineUnavailable,

    /// The engine failed to start or failed mid-generation
    Inference(String),

    /// The speech synthesis socket failed or closed before its final marker
    Synthesis(String),

    /// The session task ended without reporting (panic or cancellation)
    Aborted(String),
}

impl SessionError {
    /// Stable machine-readable kind, used in logs and the health endpoint.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::EngineUnavailable => "engine_unavailable",
            SessionError::Inference(_) => "inference_error",
            SessionError::Synthesis(_) => "synthesis_error",
            SessionError::Aborted(_) => "aborted",
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::EngineUnavailable => write!(f, "Inference engine is not initialized"),
            SessionError::Inference(msg) => write!(f, "Inference failed: {}", msg),
            SessionError::Synthesis(msg) => write!(f, "Speech synthesis failed: {}", msg),
            SessionError::Aborted(msg) => write!(f, "Session aborted: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::ValidationError("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::SessionBusy("id".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(AppError::SubscriberActive.status_code(), StatusCode::CONFLICT);
        assert_eq!(AppError::Internal("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_session_error_kinds() {
        assert_eq!(SessionError::EngineUnavailable.kind(), "engine_unavailable");
        assert_eq!(SessionError::Synthesis("closed".into()).to_string(), "Speech synthesis failed: closed");
    }
}
