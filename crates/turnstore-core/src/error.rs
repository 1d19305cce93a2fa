//! Error types for turnstore.
//!
//! These are the errors raised while building and validating core values
//! (events, deltas, configuration). Storage backends wrap them in their own
//! error type.

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for turnstore core values.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed event, delta or identifier
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => Some("Check your config file at ~/.config/turnstore/config.toml"),
            Error::Validation(_) => Some("Fix the event or delta and append it again"),
            _ => None,
        }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}
