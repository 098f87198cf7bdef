//! Error taxonomy for the dispatch and scoring loop.
//!
//! Peer-level kinds (`PeerUnreachable`, `Timeout`, `InvalidResponse`) never
//! abort a round; they are recorded on the peer's [`ResponseRecord`] instead.
//! Round-level kinds short-circuit the round or the score update only.
//!
//! [`ResponseRecord`]: crate::messages::ResponseRecord

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failure, carried on the wire inside response records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PeerUnreachable,
    Timeout,
    InvalidResponse,
    AuthExpired,
    ValidationServiceError,
    NoAvailablePeers,
    ArrayLengthMismatch,
}

impl ErrorKind {
    /// Map a transport-level error to the peer-level kind it represents.
    ///
    /// Anything that is not recognizably a timeout or a connection failure is
    /// treated as a malformed exchange.
    pub fn classify(err: &anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<ValidatorError>() {
            return e.kind();
        }
        for cause in err.chain() {
            if cause.is::<tokio::time::error::Elapsed>() {
                return ErrorKind::Timeout;
            }
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                return match io.kind() {
                    std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                    std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                        ErrorKind::InvalidResponse
                    }
                    _ => ErrorKind::PeerUnreachable,
                };
            }
        }
        ErrorKind::InvalidResponse
    }

    pub fn is_peer_level(self) -> bool {
        matches!(
            self,
            ErrorKind::PeerUnreachable | ErrorKind::Timeout | ErrorKind::InvalidResponse
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::PeerUnreachable => "peer_unreachable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::ValidationServiceError => "validation_service_error",
            ErrorKind::NoAvailablePeers => "no_available_peers",
            ErrorKind::ArrayLengthMismatch => "array_length_mismatch",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("peer {uid} unreachable: {reason}")]
    PeerUnreachable { uid: u32, reason: String },

    #[error("deadline exceeded after {millis} ms")]
    Timeout { millis: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("credential rejected or expired")]
    AuthExpired,

    #[error("validation service error: {0}")]
    ValidationServiceError(String),

    #[error("no available peers after filtering")]
    NoAvailablePeers,

    #[error("array length mismatch: {what} has {actual} entries, expected {expected}")]
    ArrayLengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl ValidatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidatorError::PeerUnreachable { .. } => ErrorKind::PeerUnreachable,
            ValidatorError::Timeout { .. } => ErrorKind::Timeout,
            ValidatorError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            ValidatorError::AuthExpired => ErrorKind::AuthExpired,
            ValidatorError::ValidationServiceError(_) => ErrorKind::ValidationServiceError,
            ValidatorError::NoAvailablePeers => ErrorKind::NoAvailablePeers,
            ValidatorError::ArrayLengthMismatch { .. } => ErrorKind::ArrayLengthMismatch,
        }
    }

    /// True if the error chain carries an [`ValidatorError::AuthExpired`].
    pub fn is_auth_expired(err: &anyhow::Error) -> bool {
        err.chain().any(|c| {
            matches!(c.downcast_ref::<ValidatorError>(), Some(ValidatorError::AuthExpired))
        })
    }
}
