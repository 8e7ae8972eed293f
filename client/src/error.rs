use std::{error::Error, fmt, io};

/// Client-side failures. A refused request and a timed-out one look the
/// same to callers: an error with a human reason.
#[derive(Debug)]
pub enum ClientError {
    Io(io::Error),
    /// The operation needs a connection that was never opened.
    NotConnected(&'static str),
    /// The remote answered NotAck.
    Refused(String),
    /// The remote did not answer in time.
    Timeout(String),
    /// The worker stopped making progress and was abandoned.
    Unresponsive(String),
    /// The remote answered with something the catalog does not allow here.
    Protocol(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "io error: {e}"),
            ClientError::NotConnected(what) => write!(f, "not connected to a {what}"),
            ClientError::Refused(reason) => write!(f, "request refused: {reason}"),
            ClientError::Timeout(what) => write!(f, "timed out waiting for {what}"),
            ClientError::Unresponsive(detail) => write!(f, "worker unresponsive: {detail}"),
            ClientError::Protocol(detail) => write!(f, "protocol violation: {detail}"),
        }
    }
}

impl Error for ClientError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
