use thiserror::Error;

/// LLRP session failures. Transport and protocol errors are equivalent
/// from the supervisor's point of view: both tear the session down and
/// put the reader into ERROR.
#[derive(Error, Debug)]
pub enum LlrpError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("malformed LLRP frame: {0}")]
    Malformed(&'static str),

    #[error("reader rejected request: status {code} ({description})")]
    Status { code: u16, description: String },

    #[error("unexpected message type {got} while waiting for {expected}")]
    UnexpectedMessage { expected: u16, got: u16 },
}
