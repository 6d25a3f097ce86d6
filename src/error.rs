//! Error types for the computer core.

use thiserror::Error;

/// Common error type for the computer core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A malformed address rule.
    ///
    /// Raised while loading configuration, never while deciding on an address.
    #[error("invalid address rule '{rule}': {reason}")]
    InvalidRule {
        /// The rule's host pattern as written.
        rule: String,
        /// Why the rule was rejected.
        reason: String,
    },

    /// Machine creation or execution error.
    #[error("machine error: {0}")]
    Machine(String),

    /// HTTP / WebSocket error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Scheduler error.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// The computer or scheduler has been closed.
    #[error("{0} is closed")]
    Closed(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
