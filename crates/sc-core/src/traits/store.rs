//! Persistence collaborator

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{ComposeVersion, ConnectionLog, DeploymentStatus, DeploymentTarget, Node};
use crate::types::{ComposeId, DeploymentId, NodeId};

/// Read and write access to the persisted fleet model.
///
/// Implementations join each deployment with its compose's current version
/// so the reconciler never resolves fields lazily.
#[async_trait]
pub trait Store: Send + Sync {
    /// All nodes with `enabled == true`
    async fn list_enabled_nodes(&self) -> Result<Vec<Node>, StoreError>;

    /// A single node, `None` if it was deleted
    async fn get_node(&self, id: NodeId) -> Result<Option<Node>, StoreError>;

    /// Every deployment bound to the node, joined with its target version
    async fn list_deployments_for_node(
        &self,
        node_id: NodeId,
    ) -> Result<Vec<DeploymentTarget>, StoreError>;

    /// The version a compose currently points at
    async fn get_current_compose_version(
        &self,
        compose_id: ComposeId,
    ) -> Result<ComposeVersion, StoreError>;

    /// Append a connection log entry
    async fn record_connection_log(&self, entry: ConnectionLog) -> Result<(), StoreError>;

    /// Write a deployment's reconciliation status.
    ///
    /// `None` fields in `status` leave the stored value unchanged.
    async fn update_deployment_status(
        &self,
        id: DeploymentId,
        status: DeploymentStatus,
    ) -> Result<(), StoreError>;

    /// Record the outcome of a node-level pass
    async fn update_node_last_check(
        &self,
        id: NodeId,
        at: u64,
        failed: bool,
    ) -> Result<(), StoreError>;
}
