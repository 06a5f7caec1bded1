//! sc-core: Core abstractions and configuration for supercompose
//!
//! This crate provides the shared read model, error taxonomy, configuration
//! structures, and collaborator traits used by the worker. Persistence,
//! remote hosts, the lock store, and the node update channel are all
//! expressed as traits here so the worker logic stays independent of any
//! particular backend.

pub mod config;
pub mod error;
pub mod model;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{ConnectionError, ConnectionErrorKind, ScError};
pub use types::{ComposeId, ComposeVersionId, DeploymentId, NodeId, SessionState, TenantId};
