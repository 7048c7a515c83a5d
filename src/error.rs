//! Error types for the Turnstile service.

use thiserror::Error;

use crate::intake::{IntakeError, QueueError};
use crate::policy::PolicyError;
use crate::store::StoreError;

/// Main error type for Turnstile operations.
///
/// Admission checks never return this type: a failing check is rendered as a
/// rejected [`Decision`](crate::admission::Decision). It covers bootstrap,
/// configuration and intake plumbing.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Service configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Policy parsing or validation errors
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Shared state store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Submission errors raised before a job reaches the controller
    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    /// Bounded queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(e: config::ConfigError) -> Self {
        TurnstileError::Config(e.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
