//! Error taxonomy for the recording pipeline
//!
//! Every component reports a typed error. The controller folds them into an
//! [`ErrorKind`], which is all the UI/service layer ever needs to render a
//! failed recording.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a transport session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportErrorKind {
    /// Keepalive or connect watchdog expired
    Timeout,
    /// Malformed RTSP/RTP/SDP or an unusable presentation
    ProtocolError,
    /// Server unreachable or refused the session
    Refused,
    /// Server teardown, session expiry, or anything unclassified
    Unexpected,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::ProtocolError => "protocol error",
            Self::Refused => "refused",
            Self::Unexpected => "unexpected",
        };
        f.write_str(name)
    }
}

/// Terminal error of a transport session
#[derive(Debug, Clone, Error)]
#[error("transport {kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ProtocolError, message)
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Refused, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unexpected, message)
    }
}

/// Failures of the storage capability
#[derive(Debug, Error)]
pub enum StorageError {
    /// The grant was revoked or the location is no longer writable
    #[error("storage permission denied: {0}")]
    Permission(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bad descriptor or configuration; never retried
#[derive(Debug, Clone, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

/// Errors returned by the controller surface
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("recording already started (state: {0})")]
    AlreadyStarted(crate::session::SessionState),
}

/// Coarse error kind attached to a failed recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Transport(TransportErrorKind),
    Permission,
    Io,
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(kind) => write!(f, "transport {}", kind),
            Self::Permission => f.write_str("permission"),
            Self::Io => f.write_str("io"),
            Self::Configuration => f.write_str("configuration"),
        }
    }
}

impl From<&TransportError> for ErrorKind {
    fn from(err: &TransportError) -> Self {
        ErrorKind::Transport(err.kind)
    }
}

impl From<&StorageError> for ErrorKind {
    fn from(err: &StorageError) -> Self {
        match err {
            StorageError::Permission(_) => ErrorKind::Permission,
            StorageError::Io(_) => ErrorKind::Io,
        }
    }
}

impl RecorderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(e) => e.into(),
            Self::Storage(e) => e.into(),
            Self::Configuration(_) | Self::AlreadyStarted(_) => ErrorKind::Configuration,
        }
    }
}
