//! Session pool
//!
//! Owns at most one live [`RemoteHost`] per enabled node. Other components
//! borrow a session for the duration of a single operation through
//! [`RemoteOps`]; they never keep one.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;

use sc_core::config::BackoffConfig;
use sc_core::error::{RemoteError, StoreError};
use sc_core::model::{ConnectTarget, ConnectionLog, Node, NodeCredentials};
use sc_core::traits::{CommandOutput, Connector, RemoteHost, RemoteOps, Store, WriteOptions};
use sc_core::NodeId;
use sc_envelope::SecretCodec;

use crate::remote::{ExponentialBackoff, RetryGate};

/// Pool of sessions keyed by node
pub struct SessionPool {
    /// Opens new sessions
    connector: Arc<dyn Connector>,
    /// Decrypts node credentials
    codec: SecretCodec,
    /// Receives connection logs
    store: Arc<dyn Store>,
    /// Live sessions indexed by node ID
    sessions: DashMap<NodeId, Arc<dyn RemoteHost>>,
    /// Reconnect backoff per node
    gates: DashMap<NodeId, RetryGate>,
    /// Serializes connection attempts to the same node
    connecting: DashMap<NodeId, Arc<tokio::sync::Mutex<()>>>,
    /// Template for new gates
    backoff: BackoffConfig,
}

impl SessionPool {
    /// Create an empty pool
    pub fn new(
        connector: Arc<dyn Connector>,
        codec: SecretCodec,
        store: Arc<dyn Store>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            connector,
            codec,
            store,
            sessions: DashMap::new(),
            gates: DashMap::new(),
            connecting: DashMap::new(),
            backoff,
        }
    }

    /// Connect to every enabled node concurrently.
    ///
    /// Individual failures are logged and skipped. Returns the number of
    /// nodes connected.
    pub async fn start(&self) -> Result<usize, StoreError> {
        let nodes = self.store.list_enabled_nodes().await?;
        tracing::info!("Connecting to {} enabled nodes", nodes.len());

        let results = join_all(nodes.iter().map(|node| self.ensure_connected(node, true))).await;
        let connected = results.iter().filter(|r| r.is_ok()).count();

        tracing::info!("Connected to {}/{} nodes", connected, nodes.len());
        Ok(connected)
    }

    /// Get the live session for a node
    pub fn get(&self, node_id: NodeId) -> Result<Arc<dyn RemoteHost>, RemoteError> {
        let session = self
            .sessions
            .get(&node_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(RemoteError::NodeNotConnected(node_id))?;

        if session.is_connected() {
            Ok(session)
        } else {
            self.sessions
                .remove_if(&node_id, |_, current| Arc::ptr_eq(current, &session));
            Err(RemoteError::NodeNotConnected(node_id))
        }
    }

    /// Whether the pool holds a live session for the node
    pub fn is_connected(&self, node_id: NodeId) -> bool {
        self.get(node_id).is_ok()
    }

    /// Node IDs with a session in the pool
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.sessions.iter().map(|r| *r.key()).collect()
    }

    /// Number of sessions in the pool
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if pool is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Reuse the node's live session or open a new one.
    ///
    /// Without `force`, a node that failed recently is not retried until its
    /// backoff expires.
    pub async fn ensure_connected(
        &self,
        node: &Node,
        force: bool,
    ) -> Result<Arc<dyn RemoteHost>, RemoteError> {
        if let Ok(session) = self.get(node.id) {
            return Ok(session);
        }

        let guard = self
            .connecting
            .entry(node.id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = guard.lock().await;

        // Someone else may have connected while we waited
        if let Ok(session) = self.get(node.id) {
            return Ok(session);
        }

        if !force {
            if let Some(gate) = self.gates.get(&node.id) {
                if !gate.is_open() {
                    tracing::debug!(
                        "Node {} in reconnect backoff for another {:?}",
                        node.id,
                        gate.remaining()
                    );
                    return Err(RemoteError::NodeNotConnected(node.id));
                }
            }
        }

        match self.connect(node).await {
            Ok(session) => {
                self.gate(node.id).succeeded();
                self.sessions.insert(node.id, Arc::clone(&session));
                Ok(session)
            }
            Err(e) => {
                let delay = self.gate(node.id).failed();
                tracing::warn!(
                    "Failed to connect to node {} ({}): {}. Next attempt in {:?}",
                    node.name,
                    node.id,
                    e,
                    delay
                );
                Err(e)
            }
        }
    }

    /// Close and forget a node's session
    pub async fn remove(&self, node_id: NodeId) {
        self.gates.remove(&node_id);
        self.connecting.remove(&node_id);
        if let Some((_, session)) = self.sessions.remove(&node_id) {
            tracing::info!("Closing session for node {}", node_id);
            session.close().await;
        }
    }

    /// Close sessions of nodes not in `enabled`
    pub async fn retain_enabled(&self, enabled: &HashSet<NodeId>) {
        let stale: Vec<NodeId> = self
            .node_ids()
            .into_iter()
            .filter(|id| !enabled.contains(id))
            .collect();

        for node_id in stale {
            self.remove(node_id).await;
        }
    }

    /// Close every session
    pub async fn shutdown(&self) {
        let ids = self.node_ids();
        tracing::info!("Closing {} sessions", ids.len());
        join_all(ids.into_iter().map(|id| self.remove(id))).await;
    }

    fn gate(&self, node_id: NodeId) -> dashmap::mapref::one::RefMut<'_, NodeId, RetryGate> {
        self.gates
            .entry(node_id)
            .or_insert_with(|| RetryGate::new(ExponentialBackoff::from_config(&self.backoff)))
    }

    async fn connect(&self, node: &Node) -> Result<Arc<dyn RemoteHost>, RemoteError> {
        let target = match self.connect_target(node).await {
            Ok(target) => target,
            Err(e) => {
                self.record(
                    ConnectionLog::error("Node credentials could not be decrypted", &e)
                        .for_node(node),
                )
                .await;
                return Err(e);
            }
        };

        tracing::debug!("Opening session to {}", target.display_address());
        match self.connector.open(&target).await {
            Ok(session) => {
                self.record(ConnectionLog::info("Node connected").for_node(node))
                    .await;
                Ok(session)
            }
            Err(e) => {
                self.record(ConnectionLog::connection_failed(&e).for_node(node))
                    .await;
                Err(RemoteError::Connection(e))
            }
        }
    }

    /// Decrypt a node's credentials off the async runtime
    async fn connect_target(&self, node: &Node) -> Result<ConnectTarget, RemoteError> {
        let codec = self.codec.clone();
        let sealed = node.credentials.clone();
        let plaintext = tokio::task::spawn_blocking(move || codec.decrypt(&sealed))
            .await
            .map_err(|e| RemoteError::Credentials(e.to_string()))?
            .map_err(|e| RemoteError::Credentials(e.to_string()))?;
        let credentials = NodeCredentials::from_bytes(&plaintext)
            .map_err(|e| RemoteError::Credentials(e.to_string()))?;

        Ok(ConnectTarget {
            host: node.host.clone(),
            port: node.port,
            credentials,
        })
    }

    /// Drop `session` if `result` shows its transport is gone.
    ///
    /// Only that exact session is evicted, so a replacement stored by a
    /// concurrent reconnect survives.
    async fn observe<T>(
        &self,
        node_id: NodeId,
        session: &Arc<dyn RemoteHost>,
        result: Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        if let Err(e) = &result {
            if e.is_session_failure() {
                tracing::warn!("Session to node {} failed: {}", node_id, e);
                self.sessions
                    .remove_if(&node_id, |_, current| Arc::ptr_eq(current, session));
                session.close().await;
                let mut entry = ConnectionLog::error("Node became unreachable", e);
                entry.node_id = Some(node_id);
                if let RemoteError::Connection(conn) = e {
                    entry.error_kind = Some(conn.kind);
                }
                self.record(entry).await;
            }
        }
        result
    }

    async fn record(&self, entry: ConnectionLog) {
        if let Err(e) = self.store.record_connection_log(entry).await {
            tracing::warn!("Failed to record connection log: {}", e);
        }
    }
}

#[async_trait]
impl RemoteOps for SessionPool {
    async fn run_command_on(
        &self,
        node: NodeId,
        command: &str,
    ) -> Result<CommandOutput, RemoteError> {
        let session = self.get(node)?;
        let result = session.run_command(command).await;
        self.observe(node, &session, result).await
    }

    async fn file_exists_on(&self, node: NodeId, path: &str) -> Result<bool, RemoteError> {
        let session = self.get(node)?;
        let result = session.file_exists(path).await;
        self.observe(node, &session, result).await
    }

    async fn read_file_on(&self, node: NodeId, path: &str) -> Result<Vec<u8>, RemoteError> {
        let session = self.get(node)?;
        let result = session.read_file(path).await;
        self.observe(node, &session, result).await
    }

    async fn write_file_on(
        &self,
        node: NodeId,
        path: &str,
        content: &[u8],
        options: WriteOptions,
    ) -> Result<(), RemoteError> {
        let session = self.get(node)?;
        let result = session.write_file(path, content, options).await;
        self.observe(node, &session, result).await
    }

    async fn remove_file_on(&self, node: NodeId, path: &str) -> Result<(), RemoteError> {
        let session = self.get(node)?;
        let result = session.remove_file(path).await;
        self.observe(node, &session, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{FakeConnector, FakeHost, TestFleet};
    use sc_core::error::ConnectionErrorKind;
    use sc_core::model::LogSeverity;
    use std::time::Duration;

    fn backoff() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    fn pool(fleet: &TestFleet, connector: Arc<FakeConnector>) -> SessionPool {
        SessionPool::new(connector, fleet.codec.clone(), fleet.store.clone(), backoff())
    }

    #[tokio::test]
    async fn test_start_connects_enabled_nodes_only() {
        let fleet = TestFleet::new();
        let a = fleet.add_node("a", true);
        let b = fleet.add_node("b", true);
        let disabled = fleet.add_node("c", false);
        let connector = Arc::new(FakeConnector::new());

        let pool = pool(&fleet, Arc::clone(&connector));
        assert_eq!(pool.start().await.unwrap(), 2);

        assert!(pool.is_connected(a.id));
        assert!(pool.is_connected(b.id));
        assert!(!pool.is_connected(disabled.id));
        assert_eq!(connector.open_count(), 2);
    }

    #[tokio::test]
    async fn test_start_survives_failing_node() {
        let fleet = TestFleet::new();
        let good = fleet.add_node("good", true);
        let bad = fleet.add_node("bad", true);
        let connector = Arc::new(FakeConnector::new());
        connector.fail_host(&bad.host, ConnectionErrorKind::Authentication);

        let pool = pool(&fleet, Arc::clone(&connector));
        assert_eq!(pool.start().await.unwrap(), 1);
        assert!(pool.is_connected(good.id));
        assert!(matches!(pool.get(bad.id), Err(RemoteError::NodeNotConnected(_))));

        let logs = fleet.store.connection_logs();
        let failure = logs
            .iter()
            .find(|l| l.node_id == Some(bad.id) && l.severity == LogSeverity::Error)
            .unwrap();
        assert_eq!(failure.error_kind, Some(ConnectionErrorKind::Authentication));
    }

    #[tokio::test]
    async fn test_undecryptable_credentials_are_logged() {
        let fleet = TestFleet::new();
        let mut node = fleet.add_node("broken", true);
        node.credentials = b"garbage".to_vec();
        fleet.store.upsert_node(node.clone());

        let pool = pool(&fleet, Arc::new(FakeConnector::new()));
        let err = pool.ensure_connected(&node, true).await.err().unwrap();
        assert!(matches!(err, RemoteError::Credentials(_)));
        assert!(fleet
            .store
            .connection_logs()
            .iter()
            .any(|l| l.node_id == Some(node.id) && l.severity == LogSeverity::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_blocks_unforced_reconnect() {
        let fleet = TestFleet::new();
        let node = fleet.add_node("flaky", true);
        let connector = Arc::new(FakeConnector::new());
        connector.fail_host(&node.host, ConnectionErrorKind::TimedOut);

        let pool = pool(&fleet, Arc::clone(&connector));
        assert!(pool.ensure_connected(&node, false).await.is_err());
        assert_eq!(connector.open_count(), 1);

        // Still backing off
        assert!(pool.ensure_connected(&node, false).await.is_err());
        assert_eq!(connector.open_count(), 1);

        // Forced attempts ignore the backoff
        assert!(pool.ensure_connected(&node, true).await.is_err());
        assert_eq!(connector.open_count(), 2);

        connector.heal_host(&node.host);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(pool.ensure_connected(&node, false).await.is_ok());
        assert_eq!(connector.open_count(), 3);
    }

    #[tokio::test]
    async fn test_ensure_connected_reuses_session() {
        let fleet = TestFleet::new();
        let node = fleet.add_node("a", true);
        let connector = Arc::new(FakeConnector::new());

        let pool = pool(&fleet, Arc::clone(&connector));
        pool.ensure_connected(&node, false).await.unwrap();
        pool.ensure_connected(&node, false).await.unwrap();
        assert_eq!(connector.open_count(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_session_is_replaced() {
        let fleet = TestFleet::new();
        let node = fleet.add_node("a", true);
        let connector = Arc::new(FakeConnector::new());

        let pool = pool(&fleet, Arc::clone(&connector));
        let first = pool.ensure_connected(&node, false).await.unwrap();
        first.close().await;

        assert!(pool.get(node.id).is_err());
        pool.ensure_connected(&node, false).await.unwrap();
        assert_eq!(connector.open_count(), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_drops_session() {
        let fleet = TestFleet::new();
        let node = fleet.add_node("a", true);
        let host = Arc::new(FakeHost::new());
        let connector = Arc::new(FakeConnector::with_host(&node.host, Arc::clone(&host)));

        let pool = pool(&fleet, connector);
        pool.ensure_connected(&node, false).await.unwrap();

        host.fail_next_with(RemoteError::Transport("connection reset".into()));
        let err = pool.run_command_on(node.id, "true").await.unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)));
        assert!(!pool.is_connected(node.id));
    }

    #[tokio::test]
    async fn test_stale_failure_keeps_replacement_session() {
        let fleet = TestFleet::new();
        let node = fleet.add_node("a", true);
        let pool = pool(&fleet, Arc::new(FakeConnector::new()));
        let current = pool.ensure_connected(&node, false).await.unwrap();

        // A session that was replaced while an operation on it was in flight
        let stale: Arc<dyn RemoteHost> = Arc::new(FakeHost::new());
        let result: Result<(), RemoteError> = Err(RemoteError::Transport("connection reset".into()));
        assert!(pool.observe(node.id, &stale, result).await.is_err());

        assert!(pool.is_connected(node.id));
        assert!(Arc::ptr_eq(&pool.get(node.id).unwrap(), &current));
        assert!(!stale.is_connected());
    }

    #[tokio::test]
    async fn test_retain_enabled_and_shutdown() {
        let fleet = TestFleet::new();
        let a = fleet.add_node("a", true);
        let b = fleet.add_node("b", true);
        let pool = pool(&fleet, Arc::new(FakeConnector::new()));
        pool.start().await.unwrap();

        let keep: HashSet<NodeId> = [a.id].into_iter().collect();
        pool.retain_enabled(&keep).await;
        assert!(pool.is_connected(a.id));
        assert!(!pool.is_connected(b.id));

        pool.shutdown().await;
        assert!(pool.is_empty());
    }
}
