//! Error types for ember-ai

use thiserror::Error;

/// Result type alias using ember-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to a model backend
#[derive(Error, Debug)]
pub enum Error {
    /// Spawning or talking to a bridge process failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// Request was cancelled before a reply arrived
    #[error("Request aborted")]
    Aborted,

    /// Reply could not be interpreted
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Context overflow / too many tokens
    #[error("Context overflow: {0}")]
    ContextOverflow(String),
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Check if this error indicates a context overflow / too many tokens.
    ///
    /// Only looks at the typed shape of the error; free-form backend text is
    /// classified by [`crate::is_capacity_message`].
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::ContextOverflow(_) => true,
            Error::Api { error_type, .. } => {
                let et = error_type.to_lowercase();
                et.contains("context_length") || et.contains("request_too_large")
            }
            _ => false,
        }
    }
}
