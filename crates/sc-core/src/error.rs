//! Core error types for supercompose

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use sc_envelope::DecryptionError;

use crate::types::NodeId;

/// Top-level error type for the supercompose worker
#[derive(Error, Debug)]
pub enum ScError {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Remote operation error
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Reconciliation error
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// Credential decryption error
    #[error("Decryption error: {0}")]
    Decryption(#[from] DecryptionError),

    /// Persistence error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Lock backend error
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Node event channel error
    #[error("Events error: {0}")]
    Events(#[from] EventsError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a connection to a node could not be established.
///
/// The kind is shown to operators, so each one maps to a distinct
/// remediation (fix credentials, fix DNS, open the firewall, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorKind {
    /// Every configured authentication method was rejected
    Authentication,
    /// The host name could not be resolved
    DnsResolution,
    /// The configured private key could not be parsed
    PrivateKeyInvalid,
    /// The host refused the connection or is unreachable
    ConnectionRefused,
    /// The host did not answer in time
    TimedOut,
    /// Anything else
    Unknown,
}

impl ConnectionErrorKind {
    /// Operator-facing remediation hint
    pub fn hint(self) -> &'static str {
        match self {
            ConnectionErrorKind::Authentication => "check the username, password and private key",
            ConnectionErrorKind::DnsResolution => "check that the host name is spelled correctly and resolvable",
            ConnectionErrorKind::PrivateKeyInvalid => "provide the private key in OpenSSH or PEM format",
            ConnectionErrorKind::ConnectionRefused => "check that sshd is running and the port is reachable",
            ConnectionErrorKind::TimedOut => "check firewalls between the worker and the node",
            ConnectionErrorKind::Unknown => "inspect the error details",
        }
    }
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionErrorKind::Authentication => "authentication",
            ConnectionErrorKind::DnsResolution => "dns_resolution",
            ConnectionErrorKind::PrivateKeyInvalid => "private_key_invalid",
            ConnectionErrorKind::ConnectionRefused => "connection_refused",
            ConnectionErrorKind::TimedOut => "timed_out",
            ConnectionErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Classified connection failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ConnectionError {
    /// Failure classification
    pub kind: ConnectionErrorKind,
    /// Underlying error description
    pub message: String,
}

impl ConnectionError {
    /// Create a new connection error
    pub fn new(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors from operations on a node's remote session
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    /// Opening the session failed
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// The pool holds no live session for the node
    #[error("Node not connected: {0}")]
    NodeNotConnected(NodeId),

    /// The operation exceeded its timeout
    #[error("Remote operation timed out after {0:?}")]
    TimedOut(Duration),

    /// The session was closed
    #[error("Session closed")]
    Closed,

    /// SSH transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// SFTP subsystem failure
    #[error("SFTP error: {0}")]
    Sftp(String),

    /// A path component that must be a directory is something else
    #[error("Existing path {0} is not a directory")]
    NotADirectory(String),

    /// The node's stored credentials cannot be decrypted or parsed
    #[error("Node credentials unusable: {0}")]
    Credentials(String),
}

impl RemoteError {
    /// Whether the error means the session itself is no longer usable
    pub fn is_session_failure(&self) -> bool {
        matches!(
            self,
            RemoteError::Connection(_)
                | RemoteError::TimedOut(_)
                | RemoteError::Closed
                | RemoteError::Transport(_)
        )
    }
}

/// Errors from a single deployment's reconciliation
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The node lacks something the deployment requires (e.g. systemd)
    #[error("Unsupported environment: {0}")]
    UnsupportedEnvironment(String),

    /// A corrective command was rejected by the node
    #[error("Reconciliation failed: {0}")]
    ReconciliationFailed(String),

    /// Remote operation failed
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Persisting the outcome failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persistence errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Write violates a model invariant
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Backend failure
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Shorthand for a missing entity
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Lock backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Backend failure
    #[error("Lock backend error: {0}")]
    Backend(String),
}

/// Node event channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventsError {
    /// Backend failure
    #[error("Event channel error: {0}")]
    Backend(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
