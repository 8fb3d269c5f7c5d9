//! Error types for the supervisor and control layer, and JSON error responses for the API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Why the proxy could not be started
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// A process handle already exists; nothing was changed
    #[error("proxy is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    /// The rendered configuration could not be written
    #[error("failed to write proxy configuration to {}: {source}", path.display())]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The OS refused to spawn the binary (missing, not executable, bad working dir)
    #[error("failed to spawn {}: {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why the proxy could not be stopped
#[derive(Debug, thiserror::Error)]
pub enum StopError {
    /// No process handle exists; nothing to do
    #[error("proxy is not running")]
    NotRunning,

    /// The kill signal could not be delivered to the process tree
    #[error("failed to terminate proxy process tree (pid {pid}): {source}")]
    Termination {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from record operations in the control service
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The id in the request target differs from the id in the submitted record
    #[error("record id {body_id:?} does not match target id {target_id}")]
    IdMismatch { target_id: i64, body_id: Option<i64> },

    #[error("server {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Error codes for control API errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Request body is not valid JSON for the route
    InvalidJson,
    /// Path parameter is not a valid server id
    InvalidId,
    /// Query parameter could not be parsed
    InvalidQuery,
    /// Target id and record id differ
    IdMismatch,
    /// No server record with this id
    NotFound,
    /// Unknown route
    UnknownRoute,
    /// Internal control error
    InternalError,
}

impl ApiErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::InvalidJson => StatusCode::BAD_REQUEST,
            ApiErrorCode::InvalidId => StatusCode::BAD_REQUEST,
            ApiErrorCode::InvalidQuery => StatusCode::BAD_REQUEST,
            ApiErrorCode::IdMismatch => StatusCode::BAD_REQUEST,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::UnknownRoute => StatusCode::NOT_FOUND,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Control-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::InvalidJson => "INVALID_JSON",
            ApiErrorCode::InvalidId => "INVALID_ID",
            ApiErrorCode::InvalidQuery => "INVALID_QUERY",
            ApiErrorCode::IdMismatch => "ID_MISMATCH",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::UnknownRoute => "UNKNOWN_ROUTE",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&ServiceError> for ApiErrorCode {
    fn from(err: &ServiceError) -> Self {
        match err {
            ServiceError::IdMismatch { .. } => ApiErrorCode::IdMismatch,
            ServiceError::NotFound(_) => ApiErrorCode::NotFound,
            ServiceError::Store(_) => ApiErrorCode::InternalError,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ApiErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Control-Error header
pub fn json_error_response(code: ApiErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Control-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}
