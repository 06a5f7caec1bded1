//! Sealing and opening secrets with a master key

use std::fmt;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::Sha256;

use crate::envelope::{EncAlg, Envelope, KeyAlg};
use crate::error::{DecryptionError, EnvelopeError};

/// Salt length for newly written envelopes
pub const SALT_LEN: usize = 64;

/// Encrypts and decrypts secrets using keys derived from a master key.
///
/// The master key is never used directly: every envelope carries its own
/// random salt, and the cipher key is derived from the master key and that
/// salt on each call. Two encryptions of the same plaintext therefore never
/// produce the same bytes.
#[derive(Clone)]
pub struct SecretCodec {
    master_key: Arc<[u8]>,
}

impl SecretCodec {
    /// Algorithms used for newly written envelopes
    pub const ENC_ALG: EncAlg = EncAlg::Aes256Gcm;
    /// Key derivation used for newly written envelopes
    pub const KEY_ALG: KeyAlg = KeyAlg::Pbkdf2Sha256;

    /// Create a codec for the given master key
    pub fn new(master_key: impl AsRef<[u8]>) -> Self {
        Self {
            master_key: Arc::from(master_key.as_ref()),
        }
    }

    /// Seal a secret into envelope bytes
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let mut salt = vec![0u8; SALT_LEN];
        let mut nonce = vec![0u8; Self::ENC_ALG.nonce_len()];
        let mut rng = rand::rngs::OsRng;
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);

        let key = self.derive_key(Self::KEY_ALG, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| EnvelopeError::Encryption)?;
        let data = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| EnvelopeError::Encryption)?;

        Ok(Envelope {
            enc_alg: Self::ENC_ALG,
            key_alg: Self::KEY_ALG,
            salt,
            nonce,
            data,
        }
        .encode())
    }

    /// Open envelope bytes produced by [`SecretCodec::encrypt`]
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        let envelope = Envelope::decode(envelope)?;

        if envelope.nonce.len() != envelope.enc_alg.nonce_len() {
            return Err(DecryptionError::InvalidNonce(envelope.nonce.len()));
        }

        let key = self.derive_key(envelope.key_alg, &envelope.salt);
        match envelope.enc_alg {
            EncAlg::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&key)
                    .map_err(|_| DecryptionError::Malformed("derived key has wrong length".to_string()))?;
                cipher
                    .decrypt(Nonce::from_slice(&envelope.nonce), envelope.data.as_slice())
                    .map_err(|_| DecryptionError::AuthenticationFailed)
            }
        }
    }

    fn derive_key(&self, key_alg: KeyAlg, salt: &[u8]) -> Vec<u8> {
        let mut key = vec![0u8; key_alg.key_len()];
        match key_alg {
            KeyAlg::Pbkdf2Sha256 => {
                pbkdf2::pbkdf2_hmac::<Sha256>(&self.master_key, salt, key_alg.iterations(), &mut key);
            }
        }
        key
    }
}

impl fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCodec")
            .field("master_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> SecretCodec {
        SecretCodec::new("unit-test-master-key")
    }

    #[test]
    fn test_roundtrip() {
        let codec = codec();
        let secret = br#"{"username":"root","password":"hunter2"}"#;

        let sealed = codec.encrypt(secret).unwrap();
        assert_eq!(codec.decrypt(&sealed).unwrap(), secret.to_vec());
    }

    #[test]
    fn test_roundtrip_empty() {
        let codec = codec();
        let sealed = codec.encrypt(b"").unwrap();
        assert!(codec.decrypt(&sealed).unwrap().is_empty());
    }

    #[test]
    fn test_same_plaintext_differs() {
        let codec = codec();
        let a = codec.encrypt(b"same").unwrap();
        let b = codec.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_plaintext_not_visible() {
        let codec = codec();
        let sealed = codec.encrypt(b"very-secret-password").unwrap();
        assert!(!sealed
            .windows(b"very-secret-password".len())
            .any(|w| w == b"very-secret-password"));
    }

    #[test]
    fn test_wrong_master_key() {
        let sealed = codec().encrypt(b"secret").unwrap();
        let other = SecretCodec::new("another-key");
        assert_eq!(other.decrypt(&sealed), Err(DecryptionError::AuthenticationFailed));
    }

    #[test]
    fn test_tampered_ciphertext() {
        let codec = codec();
        let sealed = codec.encrypt(b"secret").unwrap();

        let mut envelope = Envelope::decode(&sealed).unwrap();
        envelope.data[0] ^= 0x01;
        let tampered = envelope.encode();

        assert_eq!(codec.decrypt(&tampered), Err(DecryptionError::AuthenticationFailed));
    }

    #[test]
    fn test_truncated_envelope() {
        let codec = codec();
        let sealed = codec.encrypt(b"secret").unwrap();
        assert!(codec.decrypt(&sealed[..sealed.len() / 2]).is_err());
    }

    #[test]
    fn test_garbage_input() {
        assert!(codec().decrypt(b"definitely not an envelope").is_err());
        assert!(codec().decrypt(b"").is_err());
    }

    #[test]
    fn test_bad_nonce_length() {
        let codec = codec();
        let sealed = codec.encrypt(b"secret").unwrap();

        let mut envelope = Envelope::decode(&sealed).unwrap();
        envelope.nonce.truncate(8);
        let bad = envelope.encode();

        assert_eq!(codec.decrypt(&bad), Err(DecryptionError::InvalidNonce(8)));
    }

    #[test]
    fn test_debug_redacts_key() {
        let rendered = format!("{:?}", codec());
        assert!(!rendered.contains("unit-test-master-key"));
    }
}
