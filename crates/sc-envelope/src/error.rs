//! Envelope error types

use thiserror::Error;

/// Errors that can occur while opening an envelope
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptionError {
    /// Envelope bytes do not follow the wire format
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// A required field is absent
    #[error("Missing envelope field: {0}")]
    MissingField(&'static str),

    /// Unknown encryption algorithm tag
    #[error("Unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(u64),

    /// Unknown key derivation tag
    #[error("Unsupported key derivation: {0}")]
    UnsupportedKeyDerivation(u64),

    /// Nonce does not match the cipher's nonce size
    #[error("Invalid nonce length: {0} bytes")]
    InvalidNonce(usize),

    /// Ciphertext failed authentication (wrong key or tampered data)
    #[error("Envelope authentication failed")]
    AuthenticationFailed,
}

/// Errors that can occur while sealing an envelope
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The cipher rejected the input
    #[error("Encryption failed")]
    Encryption,
}
