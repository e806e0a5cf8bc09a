use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Main Error Type
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    // Convenience constructors
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("{} not found", resource.into()),
        )
    }

    pub fn busy() -> Self {
        Self::new(
            ErrorCode::Busy,
            "A response is already streaming; wait for it to finish or cancel it",
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "Operation cancelled")
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Transport, message)
    }

    pub fn malformed_event(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MalformedEvent, message)
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ModelError, message)
    }

    pub fn attachment(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AttachmentError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Build an error from a non-2xx backend status and the response body.
    /// The body's `error` field is kept as a detail when present.
    pub fn backend_status(status: u16, body: &str) -> Self {
        let code = match status {
            404 => ErrorCode::NotFound,
            400..=499 => ErrorCode::BadRequest,
            _ => ErrorCode::BackendStatus,
        };
        let reported = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from));
        let mut err = Self::new(code, format!("backend returned HTTP {}", status));
        if let Some(reason) = reported {
            err = err.with_details(serde_json::json!({ "error": reason }));
        }
        err
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

// ============================================================================
// Error Codes
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Caller-side errors
    BadRequest,
    NotFound,
    Busy,
    Cancelled,
    AttachmentError,

    // Backend / transport errors
    Transport,
    BackendStatus,
    MalformedEvent,
    ModelError,
    Internal,
}

impl ErrorCode {
    /// Whether retrying the same request later could succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport | Self::BackendStatus | Self::Busy | Self::ModelError
        )
    }

    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::BadRequest | Self::NotFound | Self::Busy | Self::Cancelled | Self::AttachmentError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::Busy => "BUSY",
            Self::Cancelled => "CANCELLED",
            Self::AttachmentError => "ATTACHMENT_ERROR",
            Self::Transport => "TRANSPORT_ERROR",
            Self::BackendStatus => "BACKEND_STATUS",
            Self::MalformedEvent => "MALFORMED_EVENT",
            Self::ModelError => "MODEL_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

pub type Result<T> = std::result::Result<T, AppError>;

// ============================================================================
// Error Conversion Implementations
// ============================================================================

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::transport(format!("request timed out: {}", err))
        } else if err.is_connect() {
            Self::transport(format!("cannot reach backend: {}", err))
        } else {
            Self::transport(format!("transport error: {}", err))
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed_event(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(format!("IO error: {}", err))
    }
}

// ============================================================================
// Error Context Extension
// ============================================================================

pub trait ErrorContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<AppError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let mut err = e.into();
            err.message = format!("{}: {}", context.into(), err.message);
            err
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn log_error(error: &AppError) {
    if error.code.is_caller_error() {
        log::warn!("{}", error);
    } else {
        log::error!("{}", error);
    }
}

// ============================================================================
// Tests
// ============================================================================
