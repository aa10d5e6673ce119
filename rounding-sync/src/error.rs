//! Error types for the rounding sync engine

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RoundingError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A visit with the same MRN and date already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited by remote store")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote store error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Malformed import: {0}")]
    MalformedImport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoundingError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RoundingError::RateLimited { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RoundingError::Conflict(_))
    }

    /// Failures the sync engine recovers from by falling back to the local cache.
    pub fn is_transient(&self) -> bool {
        match self {
            RoundingError::Network(_) | RoundingError::RateLimited { .. } => true,
            RoundingError::Remote { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for RoundingError {
    fn from(err: serde_json::Error) -> Self {
        RoundingError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for RoundingError {
    fn from(err: sqlx::Error) -> Self {
        RoundingError::Cache(err.to_string())
    }
}

impl From<reqwest::Error> for RoundingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return RoundingError::Serialization(err.to_string());
        }
        match err.status() {
            Some(status) => RoundingError::Remote {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => RoundingError::Network(err.to_string()),
        }
    }
}

impl From<config::ConfigError> for RoundingError {
    fn from(err: config::ConfigError) -> Self {
        RoundingError::Config(err.to_string())
    }
}

pub type RoundingResult<T> = Result<T, RoundingError>;
