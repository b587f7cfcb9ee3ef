use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use strongbox_crypto::CryptoError;

/// Malformed frames or payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown {kind} code {code}")]
    UnknownCode { kind: &'static str, code: u16 },

    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("declared payload size {declared} disagrees with {available} bytes available")]
    SizeMismatch { declared: usize, available: usize },

    #[error("payload size {declared} exceeds maximum {max}")]
    PayloadTooLarge { declared: usize, max: usize },

    #[error("{field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("unexpected response {got} while waiting for {expected}")]
    UnexpectedResponse { expected: &'static str, got: u16 },

    #[error("bad payload: {0}")]
    BadPayload(String),

    /// GENERIC_SERVER_ERROR on the same packet more often than allowed.
    #[error("server rejected packet {packet} {attempts} times")]
    ServerRejected { packet: u32, attempts: u32 },
}

/// Every failure the transfer engine can surface.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Connect failure, timeout, reset. Retried only by the connection
    /// supervisor.
    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The server rejected registration or reconnect.
    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("integrity check failed after {attempts} attempts (local crc {local}, server crc {remote})")]
    Integrity { attempts: u32, local: u32, remote: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot read {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn network(context: &str, err: io::Error) -> Self {
        Self::Network(format!("{}: {}", context, err))
    }

    pub fn file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable category, used in status events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Protocol(_) => "protocol",
            Self::Crypto(_) => "crypto",
            Self::Authentication(_) => "authentication",
            Self::Integrity { .. } => "integrity",
            Self::Config(_) => "config",
            Self::File { .. } => "file",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        Self::Network(err.to_string())
    }
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_network_errors() {
        let err: TransferError = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer").into();
        assert!(err.is_network());
        assert_eq!(err.kind(), "network");
    }

    #[test]
    fn file_errors_keep_their_path() {
        let err = TransferError::file("/tmp/x.bin", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.kind(), "file");
        assert!(err.to_string().contains("/tmp/x.bin"));
    }
}
