//! In-memory store seeded from a TOML inventory
//!
//! Stands in for the relational database of a full deployment. The worker
//! only ever talks to it through the [`Store`] trait.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use sc_core::error::{ConfigError, ScError, StoreError};
use sc_core::model::{
    Compose, ComposeVersion, ConnectionLog, Deployment, DeploymentStatus, DeploymentTarget,
    LogSeverity, Node,
};
use sc_core::time::current_time_millis;
use sc_core::traits::Store;
use sc_core::{ComposeId, ComposeVersionId, DeploymentId, NodeId, TenantId};

/// Connection logs kept before the oldest are evicted
pub const MAX_CONNECTION_LOGS: usize = 10_000;

fn default_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

/// Fleet description loaded at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    /// Managed nodes
    pub nodes: Vec<InventoryNode>,
    /// Composes with their version history
    pub composes: Vec<InventoryCompose>,
    /// Compose to node bindings
    pub deployments: Vec<InventoryDeployment>,
}

/// A node entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryNode {
    /// Node identity
    pub id: NodeId,
    /// Owning tenant
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    /// Display name
    pub name: String,
    /// Host name or IP address
    pub host: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Hex-encoded credential envelope, see `sc-worker encrypt-credentials`
    pub credentials: String,
    /// Whether the node is managed
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A compose entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryCompose {
    /// Compose identity
    pub id: ComposeId,
    /// Owning tenant
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    /// Display name
    pub name: String,
    /// Current version, defaults to the last listed one
    #[serde(default)]
    pub current: Option<ComposeVersionId>,
    /// Versions, oldest first
    pub versions: Vec<InventoryVersion>,
}

/// A compose version entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryVersion {
    /// Version identity
    pub id: ComposeVersionId,
    /// docker-compose.yml content
    pub content: String,
    /// Target directory on nodes
    pub directory: String,
    /// systemd service name
    pub service_name: String,
    /// Whether to manage a systemd unit
    #[serde(default = "default_true")]
    pub service_enabled: bool,
}

/// A deployment entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryDeployment {
    /// Deployment identity
    pub id: DeploymentId,
    /// Deployed compose
    pub compose_id: ComposeId,
    /// Target node
    pub node_id: NodeId,
    /// Whether the deployment is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Store keeping the whole fleet model in memory
#[derive(Default)]
pub struct MemoryStore {
    nodes: DashMap<NodeId, Node>,
    composes: DashMap<ComposeId, Compose>,
    versions: DashMap<ComposeVersionId, ComposeVersion>,
    deployments: DashMap<DeploymentId, Deployment>,
    logs: Mutex<VecDeque<ConnectionLog>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an inventory file
    pub fn load(path: &Path) -> Result<Self, ScError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()).into());
        }
        let content = std::fs::read_to_string(path)?;
        let inventory: Inventory = toml::from_str(&content).map_err(ConfigError::from)?;
        Ok(Self::from_inventory(inventory)?)
    }

    /// Build a store from a parsed inventory
    pub fn from_inventory(inventory: Inventory) -> Result<Self, StoreError> {
        let store = Self::new();
        let now = current_time_millis();

        for entry in inventory.nodes {
            let credentials = hex::decode(entry.credentials.trim()).map_err(|e| {
                StoreError::Conflict(format!("credentials of node {} are not hex: {}", entry.id, e))
            })?;
            store.upsert_node(Node {
                id: entry.id,
                tenant_id: entry.tenant_id,
                name: entry.name,
                host: entry.host,
                port: entry.port,
                credentials,
                enabled: entry.enabled,
                last_check: None,
                redeployment_requested_at: None,
                reconciliation_failed: false,
            });
        }

        for entry in inventory.composes {
            let versions: Vec<ComposeVersion> = entry
                .versions
                .into_iter()
                .map(|v| ComposeVersion {
                    id: v.id,
                    compose_id: entry.id,
                    content: v.content,
                    directory: v.directory,
                    service_name: v.service_name,
                    service_enabled: v.service_enabled,
                    created_at: now,
                    redeployment_requested_at: None,
                })
                .collect();
            let current = entry
                .current
                .or_else(|| versions.last().map(|v| v.id))
                .ok_or_else(|| {
                    StoreError::Conflict(format!("compose {} has no versions", entry.id))
                })?;
            store.insert_compose(
                Compose {
                    id: entry.id,
                    tenant_id: entry.tenant_id,
                    name: entry.name,
                    current,
                    versions: versions.iter().map(|v| v.id).collect(),
                },
                versions,
            )?;
        }

        for entry in inventory.deployments {
            store.insert_deployment(Deployment {
                id: entry.id,
                tenant_id: None,
                compose_id: entry.compose_id,
                node_id: entry.node_id,
                enabled: entry.enabled,
                last_deployed_compose_version_id: None,
                last_check: None,
                redeployment_requested_at: None,
                last_deployed_as_enabled: None,
                reconciliation_failed: false,
            })?;
        }

        tracing::info!(
            "Inventory loaded: {} nodes, {} composes, {} deployments",
            store.nodes.len(),
            store.composes.len(),
            store.deployments.len()
        );
        Ok(store)
    }

    /// Insert or replace a node
    pub fn upsert_node(&self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    /// Current state of a node
    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.nodes.get(&id).map(|r| r.clone())
    }

    /// Enable or disable a node
    pub fn set_node_enabled(&self, id: NodeId, enabled: bool) -> Result<(), StoreError> {
        let mut node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("node", id))?;
        node.enabled = enabled;
        Ok(())
    }

    /// Remove a node and every deployment bound to it
    pub fn remove_node(&self, id: NodeId) {
        self.nodes.remove(&id);
        self.deployments.retain(|_, d| d.node_id != id);
    }

    /// Insert a compose with its versions
    pub fn insert_compose(
        &self,
        compose: Compose,
        versions: Vec<ComposeVersion>,
    ) -> Result<(), StoreError> {
        if !versions.iter().any(|v| v.id == compose.current) {
            return Err(StoreError::Conflict(format!(
                "current version {} of compose {} is not among its versions",
                compose.current, compose.id
            )));
        }
        for version in versions {
            if version.compose_id != compose.id {
                return Err(StoreError::Conflict(format!(
                    "version {} belongs to compose {}",
                    version.id, version.compose_id
                )));
            }
            self.versions.insert(version.id, version);
        }
        self.composes.insert(compose.id, compose);
        Ok(())
    }

    /// Append a version to a compose and make it current
    pub fn push_version(&self, version: ComposeVersion) -> Result<(), StoreError> {
        let mut compose = self
            .composes
            .get_mut(&version.compose_id)
            .ok_or_else(|| StoreError::not_found("compose", version.compose_id))?;
        compose.current = version.id;
        compose.versions.push(version.id);
        self.versions.insert(version.id, version);
        Ok(())
    }

    /// Insert a deployment, enforcing one per (compose, node)
    pub fn insert_deployment(&self, deployment: Deployment) -> Result<(), StoreError> {
        if !self.nodes.contains_key(&deployment.node_id) {
            return Err(StoreError::not_found("node", deployment.node_id));
        }
        if !self.composes.contains_key(&deployment.compose_id) {
            return Err(StoreError::not_found("compose", deployment.compose_id));
        }
        let duplicate = self.deployments.iter().any(|d| {
            d.id != deployment.id
                && d.node_id == deployment.node_id
                && d.compose_id == deployment.compose_id
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "compose {} is already deployed to node {}",
                deployment.compose_id, deployment.node_id
            )));
        }
        self.deployments.insert(deployment.id, deployment);
        Ok(())
    }

    /// Current state of a deployment
    pub fn deployment(&self, id: DeploymentId) -> Option<Deployment> {
        self.deployments.get(&id).map(|r| r.clone())
    }

    /// Enable or disable a deployment
    pub fn set_deployment_enabled(&self, id: DeploymentId, enabled: bool) -> Result<(), StoreError> {
        let mut deployment = self
            .deployments
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("deployment", id))?;
        deployment.enabled = enabled;
        Ok(())
    }

    /// Ask for a deployment to be redeployed on the next pass
    pub fn request_redeploy(&self, id: DeploymentId) -> Result<(), StoreError> {
        let mut deployment = self
            .deployments
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("deployment", id))?;
        let now = current_time_millis();
        deployment.redeployment_requested_at =
            Some(now.max(deployment.last_check.unwrap_or(0) + 1));
        Ok(())
    }

    /// Snapshot of the recorded connection logs, oldest first
    pub fn connection_logs(&self) -> Vec<ConnectionLog> {
        self.logs
            .lock()
            .map(|logs| logs.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn target(&self, deployment: &Deployment) -> Result<DeploymentTarget, StoreError> {
        let compose = self
            .composes
            .get(&deployment.compose_id)
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::not_found("compose", deployment.compose_id))?;
        let version = self
            .versions
            .get(&compose.current)
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::not_found("compose version", compose.current))?;
        let last_deployed_version = deployment
            .last_deployed_compose_version_id
            .and_then(|id| self.versions.get(&id).map(|r| r.clone()));

        Ok(DeploymentTarget {
            deployment: deployment.clone(),
            compose_name: compose.name,
            version,
            last_deployed_version,
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_enabled_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self
            .nodes
            .iter()
            .filter(|n| n.enabled)
            .map(|n| n.clone())
            .collect())
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<Node>, StoreError> {
        Ok(self.node(id))
    }

    async fn list_deployments_for_node(
        &self,
        node_id: NodeId,
    ) -> Result<Vec<DeploymentTarget>, StoreError> {
        let deployments: Vec<Deployment> = self
            .deployments
            .iter()
            .filter(|d| d.node_id == node_id)
            .map(|d| d.clone())
            .collect();
        deployments.iter().map(|d| self.target(d)).collect()
    }

    async fn get_current_compose_version(
        &self,
        compose_id: ComposeId,
    ) -> Result<ComposeVersion, StoreError> {
        let current = self
            .composes
            .get(&compose_id)
            .map(|c| c.current)
            .ok_or_else(|| StoreError::not_found("compose", compose_id))?;
        self.versions
            .get(&current)
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::not_found("compose version", current))
    }

    async fn record_connection_log(&self, entry: ConnectionLog) -> Result<(), StoreError> {
        let node = entry.node_id.map(|id| id.to_string()).unwrap_or_default();
        let detail = entry.error.as_deref().unwrap_or("");
        match entry.severity {
            LogSeverity::Info => tracing::info!(node_id = %node, "{}", entry.message),
            LogSeverity::Warning => tracing::warn!(node_id = %node, "{}", entry.message),
            LogSeverity::Error => {
                tracing::error!(node_id = %node, error = %detail, "{}", entry.message)
            }
        }

        let mut logs = self
            .logs
            .lock()
            .map_err(|_| StoreError::Backend("connection log lock poisoned".to_string()))?;
        if logs.len() >= MAX_CONNECTION_LOGS {
            logs.pop_front();
        }
        logs.push_back(entry);
        Ok(())
    }

    async fn update_deployment_status(
        &self,
        id: DeploymentId,
        status: DeploymentStatus,
    ) -> Result<(), StoreError> {
        let mut deployment = self
            .deployments
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("deployment", id))?;
        deployment.last_check = Some(status.last_check);
        deployment.reconciliation_failed = status.reconciliation_failed;
        if let Some(version) = status.last_deployed_compose_version_id {
            deployment.last_deployed_compose_version_id = Some(version);
        }
        if let Some(enabled) = status.last_deployed_as_enabled {
            deployment.last_deployed_as_enabled = Some(enabled);
        }
        Ok(())
    }

    async fn update_node_last_check(
        &self,
        id: NodeId,
        at: u64,
        failed: bool,
    ) -> Result<(), StoreError> {
        let mut node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("node", id))?;
        node.last_check = Some(at);
        node.reconciliation_failed = failed;
        Ok(())
    }
}
