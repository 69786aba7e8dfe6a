//! Custom error types for the crate.
//!
//! `KepcoError` is the primary error type. It mirrors the failure taxonomy of
//! a BIT 802E session:
//!
//! - **`Connect`**: host unreachable or refused. Fatal to session start and
//!   never retried automatically.
//! - **`Timeout`**: no response within the bound. Queries retry a small fixed
//!   number of times before surfacing this; plain commands do not retry.
//! - **`Validation`**: the waveform violates a hardware constraint. Raised
//!   before any I/O, so nothing is ever sent partially.
//! - **`Upload`**: the list upload protocol failed, either because a chunk
//!   landed with the wrong point count (`VerificationMismatch`) or the device
//!   queued an SCPI error (`DeviceReportedError`).
//! - **`ConnectionClosed`**: the peer closed unexpectedly. The session is dead
//!   but the disconnect interlock is still attempted.
//!
//! Low-level I/O errors convert into one of these at the channel boundary.

use crate::upload::UploadError;
use crate::waveform::ValidationError;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, KepcoError>;

/// Primary error type for device communication and list uploads.
#[derive(Error, Debug)]
pub enum KepcoError {
    /// TCP session could not be established.
    ///
    /// **Recovery Strategy**: surface to the caller; check address and
    /// cabling. Never retried automatically.
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        /// Host that was dialled
        host: String,
        /// Port that was dialled
        port: u16,
        /// Refused, timed out, or resolution failure
        reason: String,
    },

    /// The device did not answer within the bound.
    #[error("Timed out after {after:?} waiting for response to '{command}'")]
    Timeout {
        /// Command or query that went unanswered
        command: String,
        /// Bound that elapsed
        after: Duration,
    },

    /// The waveform was rejected before any I/O.
    #[error("Waveform rejected: {0}")]
    Validation(#[from] ValidationError),

    /// The list upload protocol failed.
    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),

    /// The peer closed the connection.
    #[error("Connection closed by device")]
    ConnectionClosed,

    /// Operation attempted on a session that was already disconnected.
    #[error("Not connected")]
    NotConnected,

    /// `run` was called before a waveform was uploaded and verified.
    #[error("No verified list on the device; upload a waveform first")]
    NoListLoaded,

    /// The operation was cancelled at a safe boundary.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KepcoError {
    /// Build a connect error from any displayable cause.
    pub fn connect(host: impl Into<String>, port: u16, reason: impl ToString) -> Self {
        Self::Connect {
            host: host.into(),
            port,
            reason: reason.to_string(),
        }
    }

    /// Whether the call site may re-issue the same query.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, KepcoError::Timeout { .. })
    }

    /// Whether the underlying connection must be considered dead.
    #[must_use]
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            KepcoError::ConnectionClosed | KepcoError::Io(_) | KepcoError::NotConnected
        )
    }
}

impl From<figment::Error> for KepcoError {
    fn from(value: figment::Error) -> Self {
        KepcoError::Config(Box::new(value))
    }
}
