//! Error types for loginguard.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::BackendError;

/// Main error type for loginguard operations.
#[derive(Error, Debug)]
pub enum LoginGuardError {
    /// The key has used up its quota for the current window.
    ///
    /// This is an expected outcome, not a fault.
    #[error("Rate limit exceeded for key: {key}")]
    RateLimitExceeded {
        key: String,
        /// Time until the key's window expires
        retry_after: Duration,
    },

    /// Counter store failures
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// A key that cannot identify a rate limited subject
    #[error("Invalid rate limit key: {0}")]
    InvalidKey(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoginGuardError {
    /// Whether this error is a rate limit decision rather than a fault.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LoginGuardError::RateLimitExceeded { .. })
    }

    /// How long the caller should wait before retrying, if rate limited.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LoginGuardError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Result type alias for loginguard operations.
pub type Result<T> = std::result::Result<T, LoginGuardError>;
