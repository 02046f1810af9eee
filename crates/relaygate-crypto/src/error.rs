//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Envelope too short or structurally broken
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),

    /// Envelope version not understood by this build
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    /// Key agreement produced a low-order shared secret
    #[error("key agreement failed: low-order point")]
    LowOrderPoint,

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Public key text could not be decoded
    #[error("invalid key encoding: {0}")]
    InvalidEncoding(String),

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Identity file could not be read or written
    #[error("identity file error: {0}")]
    IdentityFile(String),
}

impl CryptoError {
    /// Returns true when the error means a message failed authentication,
    /// i.e. it was tampered with, truncated, or not meant for us.
    #[must_use]
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            CryptoError::DecryptionFailed
                | CryptoError::MalformedEnvelope(_)
                | CryptoError::UnsupportedVersion(_)
                | CryptoError::LowOrderPoint
                | CryptoError::InvalidSignature
        )
    }
}
