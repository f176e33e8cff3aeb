//! Unified error types for SuperDuperFeeder using thiserror.
//!
//! Provides consistent error handling across all components.

use thiserror::Error;

/// The unified error type for feeder operations
#[derive(Error, Debug)]
pub enum Error {
    // Storage errors
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Duplicate entity: {entity_type} already exists for {field}")]
    Duplicate { entity_type: String, field: String },

    /// A compare-and-set write lost the race; the caller should re-read.
    #[error("Write conflict on {key}")]
    Conflict { key: String },

    // Request validation errors
    #[error("Invalid input: {field} - {message}")]
    InvalidInput { field: String, message: String },

    /// A protocol-level check failed (e.g. challenge echo mismatch).
    #[error("Validation failed: {message}")]
    Validation { message: String },

    // Outbound HTTP errors
    #[error("Upstream error: {url} returned {status:?}: {message}")]
    Upstream {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Request to {url} timed out")]
    Timeout { url: String },

    // Queue errors
    #[error("Queue error: {message}")]
    Queue { message: String },

    /// A message exhausted its retry budget and was moved to the dead-letter
    /// state.
    #[error("Poison message {message_id} after {attempts} attempts")]
    Poison { message_id: String, attempts: u32 },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    // Serialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    // Feed parse errors
    #[error("Feed parse error: {message}")]
    FeedParse { message: String },

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    // Generic wrapped error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error with source
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a not found error
    pub fn not_found(entity_type: impl Into<String>, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            entity_type: entity_type.into(),
            id: id.to_string(),
        }
    }

    /// Create a duplicate error
    pub fn duplicate(entity_type: impl Into<String>, field: impl Into<String>) -> Self {
        Error::Duplicate {
            entity_type: entity_type.into(),
            field: field.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(key: impl Into<String>) -> Self {
        Error::Conflict { key: key.into() }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    /// Create an upstream error from a response status
    pub fn upstream(url: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Error::Upstream {
            url: url.into(),
            status: Some(status),
            message: message.into(),
        }
    }

    /// Create an upstream error without a status (connection-level failure)
    pub fn upstream_io(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Upstream {
            url: url.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(url: impl Into<String>) -> Self {
        Error::Timeout { url: url.into() }
    }

    /// Create a queue error
    pub fn queue(message: impl Into<String>) -> Self {
        Error::Queue {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Error::Serialization {
            message: message.into(),
        }
    }

    /// Create a feed parse error
    pub fn feed_parse(message: impl Into<String>) -> Self {
        Error::FeedParse {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is worth retrying through the queue backoff.
    ///
    /// Client-level failures (bad input, challenge mismatch, 4xx upstream
    /// responses) are terminal; infrastructure failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Storage { .. } | Error::Queue { .. } | Error::Timeout { .. } => true,
            Error::Upstream { status, .. } => match status {
                Some(code) => *code >= 500,
                None => true,
            },
            _ => false,
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::InvalidInput { .. } | Error::Validation { .. } => 400,
            Error::Duplicate { .. } | Error::Conflict { .. } => 409,
            Error::Upstream { .. } | Error::Timeout { .. } => 502,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type alias for feeder operations
pub type Result<T> = std::result::Result<T, Error>;
