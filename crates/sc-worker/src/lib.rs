//! sc-worker: Reconciles docker compose deployments on remote nodes
//!
//! The worker keeps one SSH session per enabled node and periodically, or
//! whenever a node change is announced, brings every deployment on the node
//! in line with its declared compose version: the compose file, the systemd
//! unit that runs it, and whether that unit is enabled. Several workers may
//! share a fleet; a lease per node keeps them from working on the same node
//! at once.

pub mod dispatch;
pub mod events;
pub mod lock;
pub mod pool;
pub mod reconcile;
pub mod remote;
pub mod store;
pub mod testing;

pub use dispatch::{DispatchOptions, Dispatcher, PassOutcome};
pub use lock::{LockCoordinator, LockOptions};
pub use pool::SessionPool;
pub use reconcile::Reconciler;
pub use store::MemoryStore;
