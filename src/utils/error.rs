//! Error types and handling
//!
//! Common error types used across the hardware core. Component modules return
//! [`AppResult`]; the command facade converts failures into [`ErrorResponse`]
//! values so nothing escapes to the web layer as a panic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No candidate passed probing. Callers degrade to a placeholder.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Serial or audio I/O failed. Triggers a reconnect, never a process exit.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No (or garbled) response within the command window.
    #[error("Protocol timeout: {0}")]
    ProtocolTimeout(String),

    /// Lease conflict. Surfaced to the caller, not retried automatically.
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    /// Encoder subprocess exited nonzero or its pipe broke.
    #[error("Encoder failure: {0}")]
    Encoder(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl AppError {
    /// Stable machine-readable code for the error
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            AppError::Transport(_) => "TRANSPORT_ERROR",
            AppError::ProtocolTimeout(_) => "PROTOCOL_TIMEOUT",
            AppError::ResourceBusy(_) => "RESOURCE_BUSY",
            AppError::Encoder(_) => "ENCODER_FAILURE",
            AppError::InvalidArgument(_) => "INVALID_ARGUMENT",
        }
    }
}

/// Error response handed to the web layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_keeps_code_and_message() {
        let response: ErrorResponse = AppError::ResourceBusy("microphone held by record".into()).into();
        assert_eq!(response.code, "RESOURCE_BUSY");
        assert!(response.message.contains("microphone held by record"));
    }

    #[test]
    fn test_io_error_converts() {
        let err: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(err.code(), "IO_ERROR");
    }
}
