//! Envelope structure and algorithm tags

use prost::Message;

use crate::error::DecryptionError;

/// Encryption algorithm tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EncAlg {
    /// AES-256 in GCM mode, 12-byte nonce, 16-byte tag appended to the ciphertext
    Aes256Gcm = 1,
}

impl EncAlg {
    /// Numeric tag as stored in the envelope
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    /// Nonce length required by the algorithm
    pub fn nonce_len(self) -> usize {
        match self {
            EncAlg::Aes256Gcm => 12,
        }
    }
}

impl TryFrom<u64> for EncAlg {
    type Error = DecryptionError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EncAlg::Aes256Gcm),
            other => Err(DecryptionError::UnsupportedAlgorithm(other)),
        }
    }
}

/// Key derivation tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyAlg {
    /// PBKDF2-HMAC-SHA256, 1000 iterations, 32-byte key
    Pbkdf2Sha256 = 1,
}

impl KeyAlg {
    /// Numeric tag as stored in the envelope
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    /// Iteration count of the derivation
    pub fn iterations(self) -> u32 {
        match self {
            KeyAlg::Pbkdf2Sha256 => 1000,
        }
    }

    /// Length of the derived key in bytes
    pub fn key_len(self) -> usize {
        match self {
            KeyAlg::Pbkdf2Sha256 => 32,
        }
    }
}

impl TryFrom<u64> for KeyAlg {
    type Error = DecryptionError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(KeyAlg::Pbkdf2Sha256),
            other => Err(DecryptionError::UnsupportedKeyDerivation(other)),
        }
    }
}

/// On-the-wire form of an envelope
///
/// Every field is optional so that a record missing one can be told apart
/// from a record carrying the default value.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvelopeMessage {
    #[prost(uint64, optional, tag = "1")]
    pub enc_alg: ::core::option::Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub key_alg: ::core::option::Option<u64>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub salt: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub nonce: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub data: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

/// A sealed secret with everything needed to open it except the master key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Cipher used for `data`
    pub enc_alg: EncAlg,
    /// Derivation used to turn the master key and `salt` into the cipher key
    pub key_alg: KeyAlg,
    /// Per-record random salt
    pub salt: Vec<u8>,
    /// Per-record random nonce
    pub nonce: Vec<u8>,
    /// Ciphertext including the authentication tag
    pub data: Vec<u8>,
}

impl Envelope {
    /// Serialize the envelope
    pub fn encode(&self) -> Vec<u8> {
        EnvelopeMessage::from(self.clone()).encode_to_vec()
    }

    /// Parse an envelope
    ///
    /// Unknown fields are skipped. Later occurrences of a field replace
    /// earlier ones.
    pub fn decode(src: &[u8]) -> Result<Self, DecryptionError> {
        let message = EnvelopeMessage::decode(src)
            .map_err(|e| DecryptionError::Malformed(e.to_string()))?;
        Self::try_from(message)
    }
}

impl From<Envelope> for EnvelopeMessage {
    fn from(envelope: Envelope) -> Self {
        Self {
            enc_alg: Some(envelope.enc_alg.as_u64()),
            key_alg: Some(envelope.key_alg.as_u64()),
            salt: Some(envelope.salt),
            nonce: Some(envelope.nonce),
            data: Some(envelope.data),
        }
    }
}

impl TryFrom<EnvelopeMessage> for Envelope {
    type Error = DecryptionError;

    fn try_from(message: EnvelopeMessage) -> Result<Self, Self::Error> {
        let enc_alg = EncAlg::try_from(message.enc_alg.ok_or(DecryptionError::MissingField("enc_alg"))?)?;
        let key_alg = KeyAlg::try_from(message.key_alg.ok_or(DecryptionError::MissingField("key_alg"))?)?;

        Ok(Self {
            enc_alg,
            key_alg,
            salt: message.salt.ok_or(DecryptionError::MissingField("salt"))?,
            nonce: message.nonce.ok_or(DecryptionError::MissingField("nonce"))?,
            data: message.data.ok_or(DecryptionError::MissingField("data"))?,
        })
    }
}
