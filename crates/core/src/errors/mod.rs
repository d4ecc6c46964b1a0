//! Error types and Result alias for the claim sync core

use thiserror::Error;

/// Main error type for claim synchronization
///
/// Cloneable so a single channel failure can be fanned out to every
/// listener and every caller waiting on a shared sync.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Transient transport failure; drives reconnection and polling fallback
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Caller passed an empty or malformed id; never retried
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Backend-imposed quota
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// No active user session
    #[error("Authentication required")]
    AuthenticationRequired,

    /// Realtime channel gave up after exhausting its reconnection attempts
    #[error("Realtime unavailable: {0}")]
    RealtimeUnavailable(String),

    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether the failure is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NetworkError(_) | Error::RealtimeUnavailable(_))
    }

    /// Human-readable reset estimate for rate limit failures
    ///
    /// Consumed by the UI layer's rate limit modal.
    pub fn reset_estimate(&self) -> Option<String> {
        match self {
            Error::RateLimitExceeded {
                retry_after_secs: Some(secs),
                ..
            } => Some(match *secs {
                0..=59 => format!("Try again in {} seconds", (*secs).max(1)),
                60..=3599 => {
                    let mins = secs.div_ceil(60);
                    format!("Try again in {} minute{}", mins, if mins == 1 { "" } else { "s" })
                }
                _ => {
                    let hours = secs.div_ceil(3600);
                    format!("Try again in {} hour{}", hours, if hours == 1 { "" } else { "s" })
                }
            }),
            Error::RateLimitExceeded { .. } => Some("Try again later".to_string()),
            _ => None,
        }
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::NetworkError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}
