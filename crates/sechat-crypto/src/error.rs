//! Error types for cryptographic operations.

use thiserror::Error;

/// Result type alias for cryptographic operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Cryptographic operation errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Diffie-Hellman parameters failed validation.
    #[error("Invalid DH config: {0}")]
    InvalidDhConfig(String),

    /// A public value is outside the allowed range.
    #[error("Invalid DH public value: {0}")]
    InvalidPublicValue(String),

    /// The handshake is missing its parameters or the peer value.
    #[error("Key exchange failed: {0}")]
    KeyExchange(String),

    /// Packet encryption failed.
    #[error("Packet encryption failed: {0}")]
    Encryption(String),

    /// Packet decryption or integrity verification failed.
    #[error("Packet decryption failed: {0}")]
    Decryption(String),

    /// Key derivation failed.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Invalid input length.
    #[error("Invalid input length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length in bytes.
        expected: usize,
        /// Actual length received in bytes.
        actual: usize,
    },
}
