//! # IsoKit Common
//!
//! Shared error type, logging configuration and retry helpers for the IsoKit crates.
//!
//! ## Features
//!
//! - Cross-cutting error type for configuration failures and deadlines
//! - `tracing` subscriber setup (pretty, compact or JSON output)
//! - Retry with exponential backoff and timeout wrappers

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, retry_with_backoff_if, with_timeout, RetryConfig};

/// Cross-cutting error type for IsoKit.
///
/// Crate-specific failures (network, cache, overlay) have their own enums;
/// this one covers what every crate shares: configuration and deadlines.
#[derive(Error, Debug)]
pub enum IsoKitError {
    /// Configuration could not be read or is invalid.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl IsoKitError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IsoKitError::Timeout(_))
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            IsoKitError::Config { .. } => "config",
            IsoKitError::Timeout(_) => "timeout",
        }
    }
}

/// Result type alias for IsoKit operations.
pub type Result<T> = std::result::Result<T, IsoKitError>;
