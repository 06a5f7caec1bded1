//! Lock store capability

use async_trait::async_trait;
use std::time::Duration;

use crate::error::LockError;

/// A store of leased, token-owned keys.
///
/// Every operation on an existing key must compare the token first so a
/// holder whose lease expired cannot touch a lock someone else now owns.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set `key` to `token` for `lease` unless the key is held.
    /// Returns whether the lock was taken.
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, LockError>;

    /// Push the expiry of a lock still owned by `token` to now + `lease`.
    /// Returns false if the lock was lost.
    async fn extend(&self, key: &str, token: &str, lease: Duration) -> Result<bool, LockError>;

    /// Delete `key` if it is still owned by `token`
    async fn release(&self, key: &str, token: &str) -> Result<(), LockError>;
}
