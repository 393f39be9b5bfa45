//! Error types for ember-agent

use thiserror::Error;

/// Result type alias using ember-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during agent operations
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the model backend
    #[error(transparent)]
    Ai(#[from] ember_ai::Error),

    /// Summarization failed and the conversation was restored or cut back
    #[error("Compaction error: {0}")]
    Compaction(String),
}

impl Error {
    /// Check if this error indicates a context overflow
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::Ai(e) => e.is_context_overflow(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_overflow_only_from_backend() {
        let overflow = Error::from(ember_ai::Error::api("context_length_exceeded", "too long"));
        assert!(overflow.is_context_overflow());
        assert!(overflow.to_string().contains("too long"));

        let compaction = Error::Compaction("Nothing to compact".to_string());
        assert!(!compaction.is_context_overflow());
        assert_eq!(compaction.to_string(), "Compaction error: Nothing to compact");
    }
}
