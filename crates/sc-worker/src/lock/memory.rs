//! Process-local lock backend

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use sc_core::error::LockError;
use sc_core::traits::LockBackend;

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    expires_at: Instant,
}

/// Lock backend for a single worker process
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    leases: DashMap<String, Lease>,
}

impl MemoryLockBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is held by anyone right now
    pub fn is_held(&self, key: &str) -> bool {
        self.leases
            .get(key)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let fresh = Lease {
            token: token.to_string(),
            expires_at: now + lease,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at <= now {
                    entry.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn extend(&self, key: &str, token: &str, lease: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        match self.leases.get_mut(key) {
            Some(mut current) if current.token == token && current.expires_at > now => {
                current.expires_at = now + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        self.leases.remove_if(key, |_, current| current.token == token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_can_be_taken() {
        let backend = MemoryLockBackend::new();
        assert!(backend.try_acquire("k", "a", LEASE).await.unwrap());
        assert!(!backend.try_acquire("k", "b", LEASE).await.unwrap());

        tokio::time::advance(LEASE).await;
        assert!(backend.try_acquire("k", "b", LEASE).await.unwrap());

        // The old holder can neither extend nor release the new lease
        assert!(!backend.extend("k", "a", LEASE).await.unwrap());
        backend.release("k", "a").await.unwrap();
        assert!(backend.is_held("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_pushes_expiry() {
        let backend = MemoryLockBackend::new();
        backend.try_acquire("k", "a", LEASE).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(backend.extend("k", "a", LEASE).await.unwrap());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(backend.is_held("k"));
    }
}
