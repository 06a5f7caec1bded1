//! Collaborator traits
//!
//! The worker talks to persistence, remote hosts, the node update channel
//! and the shared lock store only through these traits.

mod events;
mod lock;
mod remote;
mod store;

pub use events::{NodeEvents, NODE_UPDATES_CHANNEL};
pub use lock::LockBackend;
pub use remote::{CommandOutput, Connector, RemoteHost, RemoteOps, WriteOptions};
pub use store::Store;
