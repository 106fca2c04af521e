// src/error.rs

use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced to callers of the rotation engine.
///
/// Only request-shaped problems and programmer errors appear here. Transient
/// provider failures, rate limits, exhausted quotas and bad credentials are
/// absorbed by rotation and reported as an empty outcome, never as an error.
#[derive(Error, Debug)]
pub enum RotatorError {
    #[error("invalid model identifier '{model}': expected 'provider/model_name'")]
    InvalidModel { model: String },

    #[error("provider rejected the request: {message}")]
    BadRequest { message: String },

    #[error("input exceeds the model's context window: {message}")]
    ContextLength { message: String },

    #[error("client is closed")]
    Closed,

    #[error("configuration invalid: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    #[error("configuration parse error: {message}")]
    ConfigParse { message: String },

    #[error("usage persistence failed: {operation} - {message}")]
    Persistence { operation: String, message: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("io operation failed: {operation} - {message}")]
    Io { operation: String, message: String },
}

impl RotatorError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn config_validation(
        message: impl Into<String>,
        field: Option<impl Into<String>>,
    ) -> Self {
        Self::ConfigValidation {
            message: message.into(),
            field: field.map(Into::into),
        }
    }

    pub fn persistence(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persistence {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True for errors the caller can fix by changing the request.
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            Self::InvalidModel { .. }
                | Self::BadRequest { .. }
                | Self::ContextLength { .. }
                | Self::Closed
        )
    }

    /// Log the error at the appropriate level.
    pub fn log(&self, request_id: &str) {
        if self.is_caller_fault() {
            warn!(error = %self, request_id, "Request error");
        } else {
            error!(error = %self, request_id, "Engine error");
        }
    }
}

impl From<serde_json::Error> for RotatorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

/// Result type alias for the engine.
pub type Result<T, E = RotatorError> = std::result::Result<T, E>;
