//! Error types for Windowguard.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::Tier;

/// Main error type for Windowguard operations.
#[derive(Error, Debug)]
pub enum WindowguardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limit that can never be satisfied (zero max or zero window)
    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    /// A backend could not serve the call; the limiter falls through to the next tier
    #[error("{tier} backend unavailable: {source}")]
    BackendUnavailable {
        tier: Tier,
        #[source]
        source: BackendFailure,
    },
}

/// The underlying cause of a [`WindowguardError::BackendUnavailable`].
#[derive(Error, Debug)]
pub enum BackendFailure {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected reply: {0}")]
    Protocol(String),
}

impl WindowguardError {
    /// Wrap a backend failure for the given tier.
    pub fn unavailable(tier: Tier, source: impl Into<BackendFailure>) -> Self {
        WindowguardError::BackendUnavailable {
            tier,
            source: source.into(),
        }
    }
}

/// Result type alias for Windowguard operations.
pub type Result<T> = std::result::Result<T, WindowguardError>;
