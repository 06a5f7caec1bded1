//! Remote host traits

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{ConnectionError, RemoteError};
use crate::model::ConnectTarget;
use crate::types::{NodeId, SessionState};

/// Result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, -1 if the host never reported one
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Options for [`RemoteHost::write_file`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Create missing parent directories first
    pub recursive: bool,
}

impl WriteOptions {
    /// Options with parent directory creation enabled
    pub fn recursive() -> Self {
        Self { recursive: true }
    }
}

/// One authenticated session to one node
#[async_trait]
pub trait RemoteHost: Send + Sync {
    /// Current lifecycle state
    fn state(&self) -> SessionState;

    /// Whether the session can still run operations
    fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Execute a shell command
    async fn run_command(&self, command: &str) -> Result<CommandOutput, RemoteError>;

    /// Whether a regular file exists at `path`
    async fn file_exists(&self, path: &str) -> Result<bool, RemoteError>;

    /// Read a whole file
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RemoteError>;

    /// Create or truncate a file with `content`
    async fn write_file(
        &self,
        path: &str,
        content: &[u8],
        options: WriteOptions,
    ) -> Result<(), RemoteError>;

    /// Delete a file. A missing file is not an error.
    async fn remove_file(&self, path: &str) -> Result<(), RemoteError>;

    /// Release the transport. Calling it again is a no-op.
    async fn close(&self);
}

/// Opens sessions to hosts
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate
    async fn open(&self, target: &ConnectTarget) -> Result<Arc<dyn RemoteHost>, ConnectionError>;
}

/// Remote operations addressed by node id.
///
/// This is the only surface the reconciler uses to touch hosts.
#[async_trait]
pub trait RemoteOps: Send + Sync {
    /// Run a command on the node's session
    async fn run_command_on(&self, node: NodeId, command: &str)
        -> Result<CommandOutput, RemoteError>;

    /// Check for a file on the node
    async fn file_exists_on(&self, node: NodeId, path: &str) -> Result<bool, RemoteError>;

    /// Read a file from the node
    async fn read_file_on(&self, node: NodeId, path: &str) -> Result<Vec<u8>, RemoteError>;

    /// Write a file on the node
    async fn write_file_on(
        &self,
        node: NodeId,
        path: &str,
        content: &[u8],
        options: WriteOptions,
    ) -> Result<(), RemoteError>;

    /// Delete a file on the node
    async fn remove_file_on(&self, node: NodeId, path: &str) -> Result<(), RemoteError>;
}
