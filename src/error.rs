use thiserror::Error;

use crate::modbus::ExceptionCode;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the register client.
///
/// Variants fall in three classes: caller/config errors (never retried),
/// transient transport errors (retried by the scheduler) and session errors
/// (one re-login cycle, then surfaced).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unknown quantity: {0}")]
    UnknownQuantity(String),

    #[error("value out of range for {name}: {reason}")]
    OutOfRange { name: String, reason: String },

    #[error("register {0} is read-only")]
    ReadOnlyViolation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no response from device within {0:?}")]
    TransportTimeout(std::time::Duration),

    #[error("connection closed by peer: {0}")]
    TransportClosed(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("access denied by device (elevated session required)")]
    AccessDenied,

    #[error("device returned exception {0}")]
    DeviceException(ExceptionCode),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request scheduler is not running")]
    SchedulerClosed,
}

impl Error {
    pub fn out_of_range(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::OutOfRange {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidArgument(reason.into())
    }

    /// Whether the scheduler may spend retry budget on this error.
    ///
    /// Unmapped exception codes are treated as terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransportTimeout(_) | Error::TransportClosed(_) | Error::NotConnected(_) => true,
            Error::DeviceException(code) => code.is_transient(),
            _ => false,
        }
    }

    /// Errors that leave the link in an unknown state and force a reconnect.
    pub fn faults_link(&self) -> bool {
        matches!(
            self,
            Error::TransportTimeout(_) | Error::TransportClosed(_) | Error::Protocol(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => Error::TransportTimeout(std::time::Duration::ZERO),
            ErrorKind::InvalidData => Error::Protocol(err.to_string()),
            _ => Error::TransportClosed(err.to_string()),
        }
    }
}
