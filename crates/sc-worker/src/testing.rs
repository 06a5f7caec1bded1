//! In-memory doubles for remote hosts and fleets
//!
//! [`FakeHost`] behaves like a node with a filesystem and systemd: it keeps
//! files in memory and interprets the handful of `systemctl`, `docker` and
//! compose invocations the reconciler issues. [`TestFleet`] seeds a [`MemoryStore`] with nodes
//! whose credentials are sealed with a known master key.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;

use sc_core::error::{ConnectionError, ConnectionErrorKind, RemoteError};
use sc_core::model::{
    Compose, ComposeVersion, ConnectTarget, Deployment, DeploymentTarget, Node, NodeCredentials,
    SYSTEMD_UNIT_DIR,
};
use sc_core::time::current_time_millis;
use sc_core::traits::{CommandOutput, Connector, RemoteHost, WriteOptions};
use sc_core::{ComposeId, ComposeVersionId, DeploymentId, NodeId, SessionState};
use sc_envelope::SecretCodec;

use crate::store::MemoryStore;

/// Master key used by [`TestFleet`]
pub const TEST_MASTER_KEY: &str = "fleet-test-master-key";

/// A node simulated in memory
pub struct FakeHost {
    state: AtomicU8,
    systemd: AtomicBool,
    docker: AtomicBool,
    files: Mutex<HashMap<String, Vec<u8>>>,
    enabled_units: Mutex<HashSet<String>>,
    active_units: Mutex<HashSet<String>>,
    running_stacks: Mutex<HashSet<String>>,
    commands: Mutex<Vec<String>>,
    writes: AtomicUsize,
    fail_next: Mutex<Option<RemoteError>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    /// A connected host with systemd
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Connected.as_u8()),
            systemd: AtomicBool::new(true),
            docker: AtomicBool::new(true),
            files: Mutex::new(HashMap::new()),
            enabled_units: Mutex::new(HashSet::new()),
            active_units: Mutex::new(HashSet::new()),
            running_stacks: Mutex::new(HashSet::new()),
            commands: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
            fail_next: Mutex::new(None),
        }
    }

    /// A connected host where `systemctl` is missing
    pub fn without_systemd() -> Self {
        let host = Self::new();
        host.systemd.store(false, Ordering::SeqCst);
        host
    }

    /// A connected host where `docker` is missing
    pub fn without_docker() -> Self {
        let host = Self::new();
        host.docker.store(false, Ordering::SeqCst);
        host
    }

    /// Place a file on the host without counting it as a write
    pub fn put_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.files.lock().unwrap().insert(path.to_string(), content.into());
    }

    /// Content of a file, if present
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Mark a unit enabled or disabled out of band
    pub fn set_unit_enabled(&self, unit: &str, enabled: bool) {
        let mut units = self.enabled_units.lock().unwrap();
        if enabled {
            units.insert(unit.to_string());
        } else {
            units.remove(unit);
        }
    }

    /// Whether a unit is enabled
    pub fn is_unit_enabled(&self, unit: &str) -> bool {
        self.enabled_units.lock().unwrap().contains(unit)
    }

    /// Whether a unit is running
    pub fn is_unit_active(&self, unit: &str) -> bool {
        self.active_units.lock().unwrap().contains(unit)
    }

    /// Whether the compose stack defined by `compose_path` is up
    pub fn is_stack_running(&self, compose_path: &str) -> bool {
        self.running_stacks.lock().unwrap().contains(compose_path)
    }

    /// Every command received, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Commands received that change host state
    pub fn mutating_commands(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| !is_query(c))
            .collect()
    }

    /// Number of files written through the session
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next operation fail with `error`
    pub fn fail_next_with(&self, error: RemoteError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }

    /// Forget recorded commands and writes
    pub fn reset_counters(&self) {
        self.commands.lock().unwrap().clear();
        self.writes.store(0, Ordering::SeqCst);
    }

    fn reopen(&self) {
        self.state
            .store(SessionState::Connected.as_u8(), Ordering::SeqCst);
    }

    fn guard(&self) -> Result<(), RemoteError> {
        if let Some(error) = self.fail_next.lock().unwrap().take() {
            if error.is_session_failure() {
                self.state
                    .store(SessionState::Disconnected.as_u8(), Ordering::SeqCst);
            }
            return Err(error);
        }
        if self.is_connected() {
            Ok(())
        } else {
            Err(RemoteError::Closed)
        }
    }

    fn unit_file_exists(&self, unit: &str) -> bool {
        self.files
            .lock()
            .unwrap()
            .contains_key(&format!("{}/{}", SYSTEMD_UNIT_DIR, unit))
    }

    fn systemctl(&self, args: &[&str]) -> CommandOutput {
        if !self.systemd.load(Ordering::SeqCst) {
            return exit(127, "", "sh: 1: systemctl: not found");
        }

        match args {
            ["--version"] => exit(0, "systemd 252 (252.22-1)\n", ""),
            ["daemon-reload"] => exit(0, "", ""),
            ["show", unit, ..] => {
                let state = if !self.unit_file_exists(unit) {
                    ""
                } else if self.is_unit_enabled(unit) {
                    "enabled"
                } else {
                    "disabled"
                };
                exit(0, &format!("UnitFileState={}\n", state), "")
            }
            [action @ ("enable" | "disable"), unit] => {
                if !self.unit_file_exists(unit) {
                    return exit(1, "", &format!("Failed to {} unit: Unit file {} does not exist.", action, unit));
                }
                self.set_unit_enabled(unit, *action == "enable");
                exit(0, "", "")
            }
            [action @ ("restart" | "stop"), unit] => {
                let mut active = self.active_units.lock().unwrap();
                if *action == "restart" {
                    active.insert(unit.to_string());
                } else {
                    active.remove(*unit);
                }
                exit(0, "", "")
            }
            _ => exit(1, "", "Unknown command verb."),
        }
    }
}

impl FakeHost {
    fn compose(&self, args: &[&str]) -> CommandOutput {
        if !self.docker.load(Ordering::SeqCst) {
            return exit(127, "", "sh: 1: docker: not found");
        }

        let mut file = None;
        let mut rest = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if *arg == "--file" {
                file = iter.next().map(|f| f.trim_matches(|c| c == '\'' || c == '"').to_string());
            } else {
                rest.push(*arg);
            }
        }

        match (rest.as_slice(), file) {
            (["version"], _) => exit(0, "Docker Compose version v2.27.0\n", ""),
            (["ps", "--quiet"], Some(file)) => {
                let id = if self.is_stack_running(&file) { "3f2a9c1d\n" } else { "" };
                exit(0, id, "")
            }
            (["up", ..], Some(file)) => {
                if self.file(&file).is_none() {
                    return exit(14, "", &format!("open {}: no such file or directory", file));
                }
                self.running_stacks.lock().unwrap().insert(file);
                exit(0, "", "")
            }
            (["restart"], Some(_)) => exit(0, "", ""),
            (["down"], Some(file)) => {
                self.running_stacks.lock().unwrap().remove(&file);
                exit(0, "", "")
            }
            _ => exit(1, "", "unknown docker command"),
        }
    }
}

/// Commands that only inspect host state
fn is_query(command: &str) -> bool {
    command.starts_with("systemctl show")
        || command == "systemctl --version"
        || command == "docker --version"
        || command.ends_with(" version")
        || command.ends_with(" ps --quiet")
}

fn exit(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl RemoteHost for FakeHost {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        self.guard()?;
        self.commands.lock().unwrap().push(command.to_string());

        let args: Vec<&str> = command.split_whitespace().collect();
        Ok(match args.as_slice() {
            ["systemctl", rest @ ..] => self.systemctl(rest),
            ["docker", "--version"] if self.docker.load(Ordering::SeqCst) => {
                exit(0, "Docker version 26.1.3, build b72abbb\n", "")
            }
            ["docker", "--version"] => exit(127, "", "sh: 1: docker: not found"),
            [bin, "compose", rest @ ..] if bin.ends_with("docker") => self.compose(rest),
            [bin, rest @ ..] if bin.ends_with("docker-compose") => self.compose(rest),
            ["true"] => exit(0, "", ""),
            ["false"] => exit(1, "", ""),
            _ => exit(127, "", "command not found"),
        })
    }

    async fn file_exists(&self, path: &str) -> Result<bool, RemoteError> {
        self.guard()?;
        Ok(self.files.lock().unwrap().contains_key(path))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        self.guard()?;
        self.file(path)
            .ok_or_else(|| RemoteError::Sftp(format!("No such file: {}", path)))
    }

    async fn write_file(
        &self,
        path: &str,
        content: &[u8],
        _options: WriteOptions,
    ) -> Result<(), RemoteError> {
        self.guard()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), RemoteError> {
        self.guard()?;
        if self.files.lock().unwrap().remove(path).is_some() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn close(&self) {
        self.state
            .store(SessionState::Disconnected.as_u8(), Ordering::SeqCst);
    }
}

/// Connector handing out [`FakeHost`]s by host name.
///
/// Hosts are created on first use and kept, so files survive reconnects.
#[derive(Default)]
pub struct FakeConnector {
    hosts: DashMap<String, Arc<FakeHost>>,
    failures: DashMap<String, ConnectionErrorKind>,
    targets: Mutex<Vec<ConnectTarget>>,
    opens: AtomicUsize,
}

impl FakeConnector {
    /// Connector creating default hosts on demand
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector serving `fake` for `host`
    pub fn with_host(host: &str, fake: Arc<FakeHost>) -> Self {
        let connector = Self::new();
        connector.add_host(host, fake);
        connector
    }

    /// Serve `fake` for `host`
    pub fn add_host(&self, host: &str, fake: Arc<FakeHost>) {
        self.hosts.insert(host.to_string(), fake);
    }

    /// The host served for `host`, creating it if needed
    pub fn host(&self, host: &str) -> Arc<FakeHost> {
        Arc::clone(
            self.hosts
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(FakeHost::new()))
                .value(),
        )
    }

    /// Make connections to `host` fail with `kind`
    pub fn fail_host(&self, host: &str, kind: ConnectionErrorKind) {
        self.failures.insert(host.to_string(), kind);
    }

    /// Let connections to `host` succeed again
    pub fn heal_host(&self, host: &str) {
        self.failures.remove(host);
    }

    /// Connection attempts made so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Targets of every connection attempt, in order
    pub fn targets(&self) -> Vec<ConnectTarget> {
        self.targets.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, target: &ConnectTarget) -> Result<Arc<dyn RemoteHost>, ConnectionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().unwrap().push(target.clone());

        if let Some(kind) = self.failures.get(&target.host) {
            return Err(ConnectionError::new(
                *kind,
                format!("simulated failure for {}", target.host),
            ));
        }

        let host = self.host(&target.host);
        host.reopen();
        Ok(host as Arc<dyn RemoteHost>)
    }
}

/// A [`MemoryStore`] plus the codec its node credentials are sealed with
pub struct TestFleet {
    /// Codec built from [`TEST_MASTER_KEY`]
    pub codec: SecretCodec,
    /// The fleet's store
    pub store: Arc<MemoryStore>,
}

impl Default for TestFleet {
    fn default() -> Self {
        Self::new()
    }
}

impl TestFleet {
    /// An empty fleet
    pub fn new() -> Self {
        Self {
            codec: SecretCodec::new(TEST_MASTER_KEY),
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Register a node reachable as `<name>.<id>.fleet.test`
    pub fn add_node(&self, name: &str, enabled: bool) -> Node {
        let credentials = NodeCredentials {
            username: "deploy".to_string(),
            password: Some("deploy-password".to_string()),
            private_key: None,
        };
        let sealed = self
            .codec
            .encrypt(&credentials.to_bytes().expect("serialize credentials"))
            .expect("seal credentials");

        let id = NodeId::new();
        let node = Node {
            id,
            tenant_id: None,
            name: name.to_string(),
            host: format!("{}.{}.fleet.test", name, id),
            port: 22,
            credentials: sealed,
            enabled,
            last_check: None,
            redeployment_requested_at: None,
            reconciliation_failed: false,
        };
        self.store.upsert_node(node.clone());
        node
    }

    /// Deploy a new single-version compose named `name` to `node`
    pub fn add_deployment(
        &self,
        node: &Node,
        name: &str,
        directory: &str,
        service_enabled: bool,
    ) -> DeploymentTarget {
        let compose_id = ComposeId::new();
        let version = ComposeVersion {
            id: ComposeVersionId::new(),
            compose_id,
            content: format!("services:\n  {}:\n    image: nginx:alpine\n", name),
            directory: directory.to_string(),
            service_name: name.to_string(),
            service_enabled,
            created_at: current_time_millis(),
            redeployment_requested_at: None,
        };
        let compose = Compose {
            id: compose_id,
            tenant_id: None,
            name: name.to_string(),
            current: version.id,
            versions: vec![version.id],
        };
        self.store
            .insert_compose(compose, vec![version.clone()])
            .expect("insert compose");

        let deployment = Deployment {
            id: DeploymentId::new(),
            tenant_id: None,
            compose_id,
            node_id: node.id,
            enabled: true,
            last_deployed_compose_version_id: None,
            last_check: None,
            redeployment_requested_at: None,
            last_deployed_as_enabled: None,
            reconciliation_failed: false,
        };
        self.store
            .insert_deployment(deployment.clone())
            .expect("insert deployment");

        DeploymentTarget {
            deployment,
            compose_name: name.to_string(),
            version,
            last_deployed_version: None,
        }
    }

    /// Make a new version with `content` current for the target's compose
    pub fn publish_version(&self, target: &DeploymentTarget, content: &str) -> ComposeVersion {
        let version = ComposeVersion {
            id: ComposeVersionId::new(),
            content: content.to_string(),
            created_at: current_time_millis(),
            redeployment_requested_at: None,
            ..target.version.clone()
        };
        self.store
            .push_version(version.clone())
            .expect("push version");
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_systemctl() {
        let host = FakeHost::new();
        let show = "systemctl show web.service --property=UnitFileState --no-pager";

        let out = host.run_command(show).await.unwrap();
        assert_eq!(out.stdout, "UnitFileState=\n");
        assert!(!host.run_command("systemctl enable web.service").await.unwrap().success());

        host.put_file("/etc/systemd/system/web.service", "[Unit]\n");
        assert!(host.run_command("systemctl enable web.service").await.unwrap().success());
        assert_eq!(host.run_command(show).await.unwrap().stdout, "UnitFileState=enabled\n");
        assert_eq!(host.mutating_commands().len(), 2);
    }

    #[tokio::test]
    async fn test_fake_compose_stack() {
        let host = FakeHost::new();
        let up = "/usr/bin/docker compose --file '/srv/web/docker-compose.yml' up -d --remove-orphans";
        let ps = "/usr/bin/docker compose --file '/srv/web/docker-compose.yml' ps --quiet";

        assert!(!host.run_command(up).await.unwrap().success());
        host.put_file("/srv/web/docker-compose.yml", "services: {}\n");
        assert!(host.run_command(up).await.unwrap().success());
        assert!(host.is_stack_running("/srv/web/docker-compose.yml"));
        assert_eq!(host.run_command(ps).await.unwrap().stdout.trim(), "3f2a9c1d");

        host.run_command("/usr/bin/docker compose --file '/srv/web/docker-compose.yml' down")
            .await
            .unwrap();
        assert!(!host.is_stack_running("/srv/web/docker-compose.yml"));
        assert!(host.run_command("docker --version").await.unwrap().success());
        assert!(!FakeHost::without_docker()
            .run_command("docker --version")
            .await
            .unwrap()
            .success());
        assert_eq!(host.mutating_commands().len(), 3);
    }

    #[tokio::test]
    async fn test_closed_host_rejects_operations() {
        let host = FakeHost::new();
        host.close().await;
        assert!(matches!(host.file_exists("/x").await, Err(RemoteError::Closed)));
    }

    #[tokio::test]
    async fn test_fleet_credentials_open_with_codec() {
        let fleet = TestFleet::new();
        let node = fleet.add_node("a", true);
        let plain = fleet.codec.decrypt(&node.credentials).unwrap();
        assert_eq!(NodeCredentials::from_bytes(&plain).unwrap().username, "deploy");
    }
}
