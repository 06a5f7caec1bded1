//! sc-envelope: Envelope encryption for supercompose secrets
//!
//! Node credentials are stored as self-describing envelopes. Each envelope
//! records which cipher and key derivation produced it, together with a
//! per-record salt and nonce, so that new algorithms can be introduced
//! without breaking records written by older workers.

pub mod codec;
pub mod envelope;
pub mod error;

pub use codec::SecretCodec;
pub use envelope::{EncAlg, Envelope, KeyAlg};
pub use error::{DecryptionError, EnvelopeError};
