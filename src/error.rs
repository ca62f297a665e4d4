//! Error handling and JSON error responses for the bridge

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Body type shared by every response the bridge produces, streaming or not
pub type EventBody = BoxBody<Bytes, std::io::Error>;

/// Error codes for bridge errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeErrorCode {
    /// Missing or invalid credentials
    Unauthorized,
    /// Source exceeded its request quota
    RateLimited,
    /// No route for the requested path
    NotFound,
    /// The upstream executable could not be launched
    UpstreamSpawnFailed,
    /// Internal bridge error
    InternalError,
}

impl BridgeErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            BridgeErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            BridgeErrorCode::NotFound => StatusCode::NOT_FOUND,
            BridgeErrorCode::UpstreamSpawnFailed => StatusCode::BAD_GATEWAY,
            BridgeErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Bridge-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            BridgeErrorCode::Unauthorized => "UNAUTHORIZED",
            BridgeErrorCode::RateLimited => "RATE_LIMITED",
            BridgeErrorCode::NotFound => "NOT_FOUND",
            BridgeErrorCode::UpstreamSpawnFailed => "UPSTREAM_SPAWN_FAILED",
            BridgeErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: BridgeErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: BridgeErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Bridge-Error header
pub fn json_error_response(code: BridgeErrorCode, message: impl Into<String>) -> Response<EventBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Bridge-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Errors raised inside the streaming phase of a connection
///
/// These never escape the bridge: each is converted into one terminal SSE
/// error event (when the channel is still writable) or a log entry.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Writing the initial payload to the subprocess failed
    #[error("failed to forward initial payload: {0}")]
    Forward(#[source] std::io::Error),

    /// Reading an output line from the subprocess failed
    #[error("failed to read upstream output: {0}")]
    Read(#[source] std::io::Error),
}
