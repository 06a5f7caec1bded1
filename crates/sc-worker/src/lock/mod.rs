//! Per-node reconciliation locks
//!
//! A node is reconciled by at most one worker at a time. Locks are leases:
//! the holder renews them while it works, and a crashed holder's lock simply
//! expires.

mod memory;
mod redis;

pub use self::memory::MemoryLockBackend;
pub use self::redis::RedisLockBackend;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sc_core::config::LockConfig;
use sc_core::error::LockError;
use sc_core::traits::LockBackend;
use sc_core::NodeId;

/// Prefix of node lock keys in the shared store
pub const NODE_LOCK_PREFIX: &str = "supercompose:lock:node:";

/// Timings for one acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// How long the lock survives without renewal
    pub lease: Duration,
    /// Pause between attempts
    pub retry_interval: Duration,
    /// Give up after this long
    pub retry_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            lease: config.lease,
            retry_interval: config.retry_interval,
            retry_timeout: config.retry_timeout,
        }
    }
}

/// Hands out node locks from a [`LockBackend`]
#[derive(Clone)]
pub struct LockCoordinator {
    backend: Arc<dyn LockBackend>,
}

impl LockCoordinator {
    /// Create a coordinator over a backend
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    /// Key under which a node's lock is stored
    pub fn key(node_id: NodeId) -> String {
        format!("{}{}", NODE_LOCK_PREFIX, node_id)
    }

    /// Try to lock a node, retrying until `retry_timeout`.
    ///
    /// `Ok(None)` means another holder kept the lock for the whole window;
    /// callers should skip the node rather than treat it as a failure.
    pub async fn acquire(
        &self,
        node_id: NodeId,
        options: LockOptions,
    ) -> Result<Option<NodeLock>, LockError> {
        let key = Self::key(node_id);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + options.retry_timeout;

        loop {
            if self.backend.try_acquire(&key, &token, options.lease).await? {
                tracing::debug!("Acquired lock {}", key);
                return Ok(Some(NodeLock::start(
                    Arc::clone(&self.backend),
                    key,
                    token,
                    options.lease,
                )));
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!("Lock {} still held after {:?}", key, options.retry_timeout);
                return Ok(None);
            }
            tokio::time::sleep(options.retry_interval.min(deadline - now)).await;
        }
    }
}

/// A held node lock.
///
/// Release it with [`NodeLock::release`]. Dropping it releases in the
/// background, which covers cancellation and panics.
pub struct NodeLock {
    backend: Arc<dyn LockBackend>,
    key: String,
    token: String,
    lost: Arc<AtomicBool>,
    renewal: CancellationToken,
    renewal_task: Option<JoinHandle<()>>,
    released: bool,
}

impl NodeLock {
    fn start(backend: Arc<dyn LockBackend>, key: String, token: String, lease: Duration) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let renewal = CancellationToken::new();
        let renewal_task = tokio::spawn(renew(
            Arc::clone(&backend),
            key.clone(),
            token.clone(),
            lease,
            Arc::clone(&lost),
            renewal.clone(),
        ));

        Self {
            backend,
            key,
            token,
            lost,
            renewal,
            renewal_task: Some(renewal_task),
            released: false,
        }
    }

    /// Store key of the lock
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether renewal found the lock taken over by someone else
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stop renewing and delete the lock
    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.renewal.cancel();
        if let Some(task) = self.renewal_task.take() {
            let _ = task.await;
        }
        let result = self.backend.release(&self.key, &self.token).await;
        tracing::debug!("Released lock {}", self.key);
        result
    }
}

impl Drop for NodeLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.renewal.cancel();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Lock {} dropped outside a runtime, left to expire", self.key);
            return;
        };
        let backend = Arc::clone(&self.backend);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        runtime.spawn(async move {
            if let Err(e) = backend.release(&key, &token).await {
                tracing::warn!("Failed to release lock {}: {}", key, e);
            }
        });
    }
}

/// Extend the lease every third of its duration until cancelled or lost
async fn renew(
    backend: Arc<dyn LockBackend>,
    key: String,
    token: String,
    lease: Duration,
    lost: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let period = lease / 3;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {
                match backend.extend(&key, &token, lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!("Lock {} was lost before renewal", key);
                        lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => tracing::warn!("Failed to renew lock {}: {}", key, e),
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> (LockCoordinator, Arc<MemoryLockBackend>) {
        let backend = Arc::new(MemoryLockBackend::new());
        (LockCoordinator::new(backend.clone()), backend)
    }

    fn options() -> LockOptions {
        LockOptions {
            lease: Duration::from_secs(10),
            retry_interval: Duration::from_millis(100),
            retry_timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_key_format() {
        let id = NodeId::new();
        assert_eq!(LockCoordinator::key(id), format!("supercompose:lock:node:{}", id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_acquire_times_out() {
        let (locks, _) = coordinator();
        let node = NodeId::new();

        let held = locks.acquire(node, options()).await.unwrap();
        assert!(held.is_some());

        let started = Instant::now();
        let second = locks.acquire(node, options()).await.unwrap();
        assert!(second.is_none());
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_allows_reacquire() {
        let (locks, _) = coordinator();
        let node = NodeId::new();

        let held = locks.acquire(node, options()).await.unwrap().unwrap();
        held.release().await.unwrap();

        assert!(locks.acquire(node, options()).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_lock_released_within_window() {
        let (locks, _) = coordinator();
        let node = NodeId::new();
        let held = locks.acquire(node, options()).await.unwrap().unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(node, options()).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        held.release().await.unwrap();

        assert!(waiter.await.unwrap().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases() {
        let (locks, backend) = coordinator();
        let node = NodeId::new();

        let held = locks.acquire(node, options()).await.unwrap().unwrap();
        drop(held);
        tokio::task::yield_now().await;

        assert!(!backend.is_held(&LockCoordinator::key(node)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_outlives_lease() {
        let (locks, backend) = coordinator();
        let node = NodeId::new();

        let held = locks.acquire(node, options()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(35)).await;

        assert!(backend.is_held(&LockCoordinator::key(node)));
        assert!(!held.is_lost());
        assert!(locks.acquire(node, options()).await.unwrap().is_none());
        held.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_nodes_do_not_contend() {
        let (locks, _) = coordinator();
        let a = locks.acquire(NodeId::new(), options()).await.unwrap();
        let b = locks.acquire(NodeId::new(), options()).await.unwrap();
        assert!(a.is_some() && b.is_some());
    }
}
