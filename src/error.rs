use std::io;
use thiserror::Error as ThisError;

use crate::frame;

#[derive(Debug, ThisError)]
pub enum Error {
    /// The server answered a command with an error reply. The reply stream is still in sync, so
    /// the connection can keep being used.
    #[error("server error; {0}")]
    Server(String),
    /// Client and server disagree on what was sent, the connection can't be trusted anymore.
    #[error("protocol error; expected {expected}, got {actual}")]
    ProtocolViolation { expected: String, actual: String },
    #[error("io error; {0}")]
    Io(#[from] io::Error),
    #[error("protocol error; {0}")]
    Frame(#[from] frame::Error),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("connection is no longer usable after a previous failure")]
    ConnectionBroken,
    #[error("invalid usage; {0}")]
    InvalidUsage(String),
    #[error("invalid usage; there is no active transaction")]
    NoActiveTransaction,
}

impl Error {
    pub(crate) fn protocol(expected: impl ToString, actual: impl ToString) -> Self {
        Error::ProtocolViolation {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub(crate) fn invalid_usage(msg: impl Into<String>) -> Self {
        Error::InvalidUsage(msg.into())
    }

    /// Whether the error leaves the connection in an undefined state. Fatal errors poison the
    /// connection and every later use of it fails with [`Error::ConnectionBroken`].
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation { .. }
                | Error::Io(_)
                | Error::Frame(_)
                | Error::ConnectionClosed
                | Error::ConnectionBroken
        )
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, Error::InvalidUsage(_) | Error::NoActiveTransaction)
    }
}
