//! Custom error types for the link.
//!
//! This module defines the primary error type, `LinkError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of errors that can occur,
//! from I/O and configuration issues to exchange-discipline violations.
//!
//! Errors fall into three propagation classes:
//!
//! - **Wire-local**: malformed requests never surface here at all; the
//!   protocol loop answers them with a plain-text error reply and continues.
//! - **Worker faults**: any `LinkError` escaping the adapter's worker thread
//!   is captured once and re-surfaced to the next caller into that adapter,
//!   which is dead from then on (`WorkerGone`).
//! - **Fatal**: configuration and socket-setup errors propagate with `?` to
//!   the binary's top level.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Violation(#[from] crate::exchange::ProtocolViolation),

    #[error("History error: {0}")]
    History(#[from] csv::Error),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Missing column '{0}'")]
    MissingColumn(String),

    #[error("Length mismatch: {0} values for {1} columns")]
    LengthMismatch(usize, usize),

    #[error("Wire error: {0}")]
    Wire(String),

    #[error("Malformed reply from peer: {0}")]
    Reply(String),

    #[error("Adapter worker is no longer running")]
    WorkerGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LinkError::MissingColumn("Seq Param T".to_string());
        assert_eq!(err.to_string(), "Missing column 'Seq Param T'");
    }

    #[test]
    fn test_length_mismatch_display() {
        let err = LinkError::LengthMismatch(3, 4);
        assert!(err.to_string().contains("3 values for 4 columns"));
    }
}
