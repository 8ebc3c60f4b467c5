use thiserror::Error;

use crate::reader::ReaderStatus;

/// Construction-time invariant failures for domain values.
///
/// These are always local: a read that fails validation is dropped and
/// counted, never surfaced as a connection failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid RFID tag format: {0:?}, must be 24 hex characters")]
    InvalidTag(String),

    #[error("signal strength {0} dBm outside [-70, -20] dBm")]
    SignalOutOfRange(f64),

    #[error("reader id cannot be empty")]
    EmptyReaderId,

    #[error("reader name cannot be empty")]
    EmptyReaderName,

    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u32),

    #[error("read interval must be at least 100ms, got {0}")]
    InvalidReadInterval(u64),

    #[error("invalid status transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ReaderStatus,
        to: ReaderStatus,
    },
}

/// Startup configuration failures. These abort the process with a non-zero
/// exit code; nothing is ever started against a half-valid config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var}: failed to parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var}: {value} outside allowed range ({constraint})")]
    OutOfRange {
        var: &'static str,
        value: f64,
        constraint: &'static str,
    },
}
