//! Error types for the relay chat core

use thiserror::Error;

/// Main error type for relay chat operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Network-level failure (connect, timeout, TLS); retried via backoff
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or non-success server response, or missing local key material
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Decryption failed (wrong key, tampered data, or malformed input)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Handshake password mismatch after successful decryption
    #[error("Handshake failed for contact {0}")]
    HandshakeFailed(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Identity-related error (keys, PEM import/export, signatures)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Contact not found in the directory
    #[error("Contact not found: {0}")]
    ContactNotFound(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

/// Result type alias using RelayError
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::ContactNotFound("abc123".to_string());
        assert_eq!(format!("{}", err), "Contact not found: abc123");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let relay_err: RelayError = io_err.into();
        assert!(matches!(relay_err, RelayError::Io(_)));
    }

    #[test]
    fn test_handshake_error_names_contact() {
        let err = RelayError::HandshakeFailed("deadbeef".to_string());
        assert!(format!("{}", err).contains("deadbeef"));
    }
}
