//! Error types for audit event parsing.

use thiserror::Error;

/// Errors raised when decoding persisted audit records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The event type is not one of the known audit event types.
    #[error("unknown audit event type: {0}")]
    UnknownEventType(String),

    /// The level is not one of debug/info/warning/error.
    #[error("unknown audit level: {0}")]
    UnknownLevel(String),

    /// A sealed event was appended out of sequence.
    #[error("invalid audit sequence: expected {expected}, got {actual}")]
    InvalidSequence { expected: i64, actual: i64 },
}
