/// Unified error handling for the pasarela backend pool
///
/// This module provides the error type system shared by the backend registry,
/// the selection algorithms, the health checker and the configuration layer.
use std::fmt;
use std::io;
use thiserror::Error;

use crate::core::{BackendState, BackendType};

/// Main error type for backend pool operations
#[derive(Debug, Error)]
pub enum PasarelaError {
    /// Index, id, address or group does not exist
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// `modify` was called with a stale expected state
    #[error("State conflict: expected {expected}, found {actual}")]
    Conflict {
        expected: BackendState,
        actual: BackendState,
    },

    /// Selection found zero eligible candidates
    #[error("No {role} backend available")]
    Exhausted { role: BackendType },

    /// A referenced primary or replica is down or gone at selection time
    #[error("Backend unavailable: {message}")]
    Unavailable { message: String },

    /// Backend address could not be parsed
    #[error("Malformed address '{address}': {reason}")]
    Malformed { address: String, reason: String },

    /// Backend address is already registered
    #[error("Backend already exists: {address}")]
    AlreadyExists { address: String },

    /// The connection pool adapter refused to hand out a connection
    #[error("Connection pool busy for backend {address}")]
    Busy { address: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for backend pool operations
pub type PasarelaResult<T> = Result<T, PasarelaError>;

/// Convenience methods for creating specific error types
impl PasarelaError {
    /// Create a not-found error
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        PasarelaError::NotFound { what: what.into() }
    }

    /// Create an unavailable error
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        PasarelaError::Unavailable {
            message: message.into(),
        }
    }

    /// Create a malformed-address error
    pub fn malformed<A: Into<String>, R: Into<String>>(address: A, reason: R) -> Self {
        PasarelaError::Malformed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Check if the condition is expected to clear by itself (health or load change)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PasarelaError::Exhausted { .. }
                | PasarelaError::Unavailable { .. }
                | PasarelaError::Busy { .. }
                | PasarelaError::Network(_)
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PasarelaError::Config(_) => ErrorSeverity::Critical,
            PasarelaError::Malformed { .. } => ErrorSeverity::Error,
            PasarelaError::AlreadyExists { .. } => ErrorSeverity::Error,
            PasarelaError::NotFound { .. } => ErrorSeverity::Error,
            PasarelaError::Exhausted { .. } => ErrorSeverity::Warning,
            PasarelaError::Busy { .. } => ErrorSeverity::Warning,
            PasarelaError::Network(_) => ErrorSeverity::Warning,
            PasarelaError::Unavailable { .. } => ErrorSeverity::Info,
            PasarelaError::Conflict { .. } => ErrorSeverity::Info,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
