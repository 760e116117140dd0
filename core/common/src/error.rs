//! Error taxonomy shared by every AgentVault crate.
//!
//! Each failure kind maps to a different remedy for the caller: ask for the
//! password again, re-provision hardware, re-authenticate, or abort. Expected
//! misses (`NotFound`) are never folded into security failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for AgentVault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend resource (file, keychain service, device) is unreachable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Credential was rejected. The cause is deliberately not distinguished.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Session is past its expiry, closed, or unknown.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Secret or vault does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Hardware slots are exhausted.
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Ciphertext or audit chain failed verification.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Device erased itself after too many PIN failures. Terminal.
    #[error("Device wiped: {0}")]
    DeviceWiped(String),

    /// Vault file has an unknown magic, version or KDF.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Bounded wait elapsed (e.g. touch confirmation).
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Pending operation was cancelled by the caller.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Backend-specific failure not covered above.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Field-less discriminant of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Authentication,
    SessionExpired,
    NotFound,
    Capacity,
    Integrity,
    DeviceWiped,
    UnsupportedFormat,
    InvalidInput,
    InvalidState,
    AlreadyExists,
    Timeout,
    Cancelled,
    Storage,
    Serialization,
    Io,
}

impl Error {
    /// Get the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) => ErrorKind::Connection,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::SessionExpired(_) => ErrorKind::SessionExpired,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Capacity(_) => ErrorKind::Capacity,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::DeviceWiped(_) => ErrorKind::DeviceWiped,
            Error::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether a caller may retry the operation after a bounded delay.
    ///
    /// Authentication and integrity failures are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout(_))
    }

    /// Whether this error sits on a security boundary.
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            Error::Authentication(_) | Error::Integrity(_) | Error::DeviceWiped(_)
        )
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
