//! Error types for kadnet

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timed out waiting for a response")]
    Timeout,

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Random source unavailable: {0}")]
    Entropy(getrandom::Error),
}

impl Error {
    /// Whether the error means the remote peer could not be reached.
    ///
    /// Timeouts and connection failures are routed the same way: the peer is
    /// treated as unreachable for the current round.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::ConnectionFailure(_) | Error::Io(_)
        )
    }
}

impl From<getrandom::Error> for Error {
    fn from(e: getrandom::Error) -> Self {
        Error::Entropy(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
