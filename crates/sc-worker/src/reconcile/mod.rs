//! Deployment reconciliation
//!
//! Converges one deployment at a time: the node is checked for docker, the
//! compose file is written, whatever the previously deployed version left
//! behind is retired, and then either the systemd unit or the bare compose
//! stack is brought to the declared state. Every remote mutation is preceded
//! by a read of the current state and skipped when the node already matches,
//! so a pass over an unchanged node writes nothing.

mod stack;
mod unit;

pub use stack::{compose_invocation, compose_version_command, has_containers, DOCKER_VERSION_COMMAND};
pub use unit::{render_unit, show_command, unit_file_state, DEFAULT_COMPOSE_COMMAND};

use std::sync::Arc;
use std::time::Duration;

use sc_core::error::{ReconcileError, StoreError};
use sc_core::model::{ComposeVersion, ConnectionLog, DeploymentStatus, DeploymentTarget, Node};
use sc_core::time::{elapsed_duration, is_after};
use sc_core::traits::{CommandOutput, RemoteOps, Store, WriteOptions};

/// What a successful pass changed on the node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// The compose file was created or rewritten
    pub compose_file_changed: bool,
    /// The compose file was left alone because it is not YAML or JSON
    pub compose_file_skipped: bool,
    /// The unit file was created or rewritten
    pub unit_file_changed: bool,
    /// The unit was enabled or disabled
    pub enablement_changed: bool,
    /// The compose stack was brought up without systemd
    pub started: bool,
    /// The unit or the compose stack was restarted
    pub restarted: bool,
    /// The unit or the compose stack was stopped
    pub stopped: bool,
    /// Files or units of the previously deployed version were removed
    pub previous_retired: bool,
    /// Files written
    pub remote_writes: usize,
    /// Files deleted
    pub removed_files: usize,
    /// State-changing commands issued
    pub mutating_commands: usize,
}

impl ReconcileReport {
    /// Whether the node was modified at all
    pub fn changed(&self) -> bool {
        self.remote_writes > 0 || self.removed_files > 0 || self.mutating_commands > 0
    }
}

/// Outcome of reconciling every selected deployment on a node
#[derive(Debug, Default)]
pub struct NodeReport {
    /// Deployments considered
    pub total: usize,
    /// Deployments reconciled successfully
    pub succeeded: usize,
    /// Deployments whose pass failed
    pub failed: usize,
    /// Deployments that needed nothing
    pub skipped: usize,
}

/// Whether a deployment should be reconciled in this pass.
///
/// A deployment whose last pass failed is always retried.
pub fn needs_reconciliation(node: &Node, target: &DeploymentTarget, check_interval: Duration) -> bool {
    let deployment = &target.deployment;
    let last_check = deployment.last_check;

    let redeploy_requested = is_after(deployment.redeployment_requested_at, last_check)
        || is_after(node.redeployment_requested_at, last_check)
        || is_after(target.version.redeployment_requested_at, last_check)
        || target
            .last_deployed_version
            .as_ref()
            .is_some_and(|v| is_after(v.redeployment_requested_at, last_check));

    let effective_enabled = deployment.enabled && node.enabled;
    let enabled_changed = deployment.last_deployed_as_enabled != Some(effective_enabled);
    let version_changed = deployment.last_deployed_compose_version_id != Some(target.version.id);
    let check_outdated = match last_check {
        Some(at) => elapsed_duration(at) > check_interval,
        None => true,
    };

    enabled_changed
        || deployment.reconciliation_failed
        || (effective_enabled && (version_changed || check_outdated || redeploy_requested))
}

/// Whether existing file content is recognisably a compose file
pub fn is_yaml_or_json(content: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(content) else {
        return false;
    };
    serde_yaml::from_str::<serde_yaml::Value>(text).is_ok()
        || serde_json::from_str::<serde_json::Value>(text).is_ok()
}

/// Applies declared deployment state to nodes
pub struct Reconciler {
    remote: Arc<dyn RemoteOps>,
    store: Arc<dyn Store>,
    compose_command: String,
    check_interval: Duration,
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(
        remote: Arc<dyn RemoteOps>,
        store: Arc<dyn Store>,
        compose_command: impl Into<String>,
        check_interval: Duration,
    ) -> Self {
        Self {
            remote,
            store,
            compose_command: compose_command.into(),
            check_interval,
        }
    }

    /// Reconcile every deployment of `node` that needs it, recording each
    /// outcome. One failing deployment never stops the others.
    pub async fn reconcile_node(&self, node: &Node) -> Result<NodeReport, StoreError> {
        let targets = self.store.list_deployments_for_node(node.id).await?;
        let mut report = NodeReport {
            total: targets.len(),
            ..Default::default()
        };

        for target in &targets {
            if !needs_reconciliation(node, target, self.check_interval) {
                report.skipped += 1;
                continue;
            }
            match self.reconcile_and_record(node, target).await {
                Ok(_) => report.succeeded += 1,
                Err(_) => report.failed += 1,
            }
        }

        Ok(report)
    }

    /// Reconcile one deployment and persist the outcome
    pub async fn reconcile_and_record(
        &self,
        node: &Node,
        target: &DeploymentTarget,
    ) -> Result<ReconcileReport, ReconcileError> {
        let deployment = &target.deployment;
        let result = self.reconcile(node, target).await;

        match &result {
            Ok(report) => {
                let desired = desired_enabled(node, target);
                if report.changed() {
                    self.record(
                        ConnectionLog::info("Deployment reconciled").for_deployment(deployment),
                    )
                    .await;
                }
                self.store
                    .update_deployment_status(
                        deployment.id,
                        DeploymentStatus::succeeded(target.version.id, desired),
                    )
                    .await?;
            }
            Err(e) => {
                tracing::warn!(
                    "Reconciliation of deployment {} on node {} failed: {}",
                    deployment.id,
                    node.id,
                    e
                );
                let mut entry =
                    ConnectionLog::error("Deployment reconciliation failed", e).for_deployment(deployment);
                if let ReconcileError::Remote(sc_core::error::RemoteError::Connection(conn)) = e {
                    entry.error_kind = Some(conn.kind);
                }
                self.record(entry).await;
                self.store
                    .update_deployment_status(deployment.id, DeploymentStatus::failed())
                    .await?;
            }
        }

        result
    }

    /// Diff and apply one deployment without persisting anything
    pub async fn reconcile(
        &self,
        node: &Node,
        target: &DeploymentTarget,
    ) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();
        let version = &target.version;

        tracing::debug!(
            "Reconciling deployment {} ({}) on node {}",
            target.deployment.id,
            target.compose_name,
            node.id
        );

        self.verify_node(node).await?;
        self.converge_compose_file(node, target, &mut report).await?;

        if let Some(previous) = &target.last_deployed_version {
            self.retire_previous(node, version, previous, &mut report)
                .await?;
        }

        let desired = desired_enabled(node, target);
        let redeploy = is_after(target.deployment.redeployment_requested_at, target.deployment.last_check)
            || is_after(node.redeployment_requested_at, target.deployment.last_check);

        if !version.service_enabled {
            // A unit at this path belongs to an earlier service-managed version
            self.retire_unit(node, &version.unit_name(), &version.unit_path(), &mut report)
                .await?;
            self.converge_stack(node, version, desired, redeploy, &mut report)
                .await?;
            return Ok(report);
        }

        let unit = version.unit_name();
        self.converge_unit_file(node, target, &mut report).await?;
        self.converge_enablement(node, &unit, desired, &mut report)
            .await?;

        if desired && (report.changed() || redeploy) {
            self.unit_command(node, "restart", &unit).await?;
            report.mutating_commands += 1;
            report.restarted = true;
        } else if !desired && report.enablement_changed {
            self.unit_command(node, "stop", &unit).await?;
            report.mutating_commands += 1;
            report.stopped = true;
        }

        Ok(report)
    }

    /// Fail early on nodes that cannot run compose stacks at all
    async fn verify_node(&self, node: &Node) -> Result<(), ReconcileError> {
        let docker = self.remote.run_command_on(node.id, DOCKER_VERSION_COMMAND).await?;
        if !docker.success() {
            return Err(ReconcileError::UnsupportedEnvironment(format!(
                "docker unavailable on node {} (exit {})",
                node.id, docker.exit_code
            )));
        }

        let compose = self
            .remote
            .run_command_on(node.id, &compose_version_command(&self.compose_command))
            .await?;
        if !compose.success() {
            return Err(ReconcileError::UnsupportedEnvironment(format!(
                "{} unavailable on node {} (exit {})",
                self.compose_command, node.id, compose.exit_code
            )));
        }
        Ok(())
    }

    /// Remove what the last deployed version installed at paths the current
    /// version no longer uses
    async fn retire_previous(
        &self,
        node: &Node,
        version: &ComposeVersion,
        previous: &ComposeVersion,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        if previous.service_enabled && previous.unit_path() != version.unit_path() {
            self.retire_unit(node, &previous.unit_name(), &previous.unit_path(), report)
                .await?;
        }

        let old_compose = previous.compose_path();
        if old_compose == version.compose_path()
            || !self.remote.file_exists_on(node.id, &old_compose).await?
        {
            return Ok(());
        }

        if !previous.service_enabled {
            let ps = self
                .run_checked(node, &compose_invocation(&self.compose_command, &old_compose, "ps --quiet"))
                .await?;
            if has_containers(&ps.stdout) {
                tracing::info!("Stopping previous stack {} on node {}", old_compose, node.id);
                self.run_checked(node, &compose_invocation(&self.compose_command, &old_compose, "down"))
                    .await?;
                report.mutating_commands += 1;
            }
        }

        tracing::info!("Removing previous compose file {} on node {}", old_compose, node.id);
        self.remote.remove_file_on(node.id, &old_compose).await?;
        report.removed_files += 1;
        report.previous_retired = true;
        Ok(())
    }

    /// Disable, stop and delete a unit if its file is present
    async fn retire_unit(
        &self,
        node: &Node,
        unit: &str,
        path: &str,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        if !self.remote.file_exists_on(node.id, path).await? {
            return Ok(());
        }

        tracing::info!("Retiring unit {} on node {}", unit, node.id);
        if self.unit_enabled(node, unit).await? {
            self.unit_command(node, "disable", unit).await?;
            report.mutating_commands += 1;
        }
        self.unit_command(node, "stop", unit).await?;
        report.mutating_commands += 1;

        self.remote.remove_file_on(node.id, path).await?;
        report.removed_files += 1;

        self.run_checked(node, "systemctl daemon-reload").await?;
        report.mutating_commands += 1;
        report.previous_retired = true;
        Ok(())
    }

    /// Drive a compose stack that has no systemd unit
    async fn converge_stack(
        &self,
        node: &Node,
        version: &ComposeVersion,
        desired: bool,
        redeploy: bool,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        if report.compose_file_skipped {
            return Ok(());
        }

        let path = version.compose_path();
        let ps = self
            .run_checked(node, &compose_invocation(&self.compose_command, &path, "ps --quiet"))
            .await?;
        let running = has_containers(&ps.stdout);

        let args = match (desired, running) {
            (true, false) => {
                report.started = true;
                "up -d --remove-orphans"
            }
            // `up` recreates only the services whose definition changed
            (true, true) if report.compose_file_changed => {
                report.restarted = true;
                "up -d --remove-orphans"
            }
            (true, true) if redeploy => {
                report.restarted = true;
                "restart"
            }
            (false, true) => {
                report.stopped = true;
                "down"
            }
            _ => return Ok(()),
        };

        tracing::info!("Running compose {} for {} on node {}", args, path, node.id);
        self.run_checked(node, &compose_invocation(&self.compose_command, &path, args))
            .await?;
        report.mutating_commands += 1;
        Ok(())
    }

    async fn converge_compose_file(
        &self,
        node: &Node,
        target: &DeploymentTarget,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let version = &target.version;
        let path = version.compose_path();
        let declared = version.content.as_bytes();

        if !self.remote.file_exists_on(node.id, &path).await? {
            tracing::info!("Compose file {} missing on node {}, writing", path, node.id);
            self.remote
                .write_file_on(node.id, &path, declared, WriteOptions::recursive())
                .await?;
            report.compose_file_changed = true;
            report.remote_writes += 1;
            return Ok(());
        }

        let current = self.remote.read_file_on(node.id, &path).await?;
        if current == declared {
            tracing::debug!("Compose file {} on node {} is up to date", path, node.id);
            return Ok(());
        }

        if !is_yaml_or_json(&current) {
            tracing::warn!(
                "File {} on node {} is neither YAML nor JSON, leaving it untouched",
                path,
                node.id
            );
            self.record(
                ConnectionLog::warning(format!(
                    "{} is neither YAML nor JSON, skipping for safety",
                    path
                ))
                .for_deployment(&target.deployment),
            )
            .await;
            report.compose_file_skipped = true;
            return Ok(());
        }

        tracing::info!("Compose file {} on node {} outdated, updating", path, node.id);
        self.remote
            .write_file_on(node.id, &path, declared, WriteOptions::recursive())
            .await?;
        report.compose_file_changed = true;
        report.remote_writes += 1;
        Ok(())
    }

    async fn converge_unit_file(
        &self,
        node: &Node,
        target: &DeploymentTarget,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let systemctl = self.remote.run_command_on(node.id, "systemctl --version").await?;
        if !systemctl.success() {
            return Err(ReconcileError::UnsupportedEnvironment(format!(
                "systemctl unavailable on node {} (exit {})",
                node.id, systemctl.exit_code
            )));
        }

        let version = &target.version;
        let path = version.unit_path();
        let rendered = render_unit(&target.compose_name, version, &self.compose_command);

        if self.remote.file_exists_on(node.id, &path).await? {
            let current = self.remote.read_file_on(node.id, &path).await?;
            if current == rendered.as_bytes() {
                tracing::debug!("Unit file {} on node {} is up to date", path, node.id);
                return Ok(());
            }
        }

        tracing::info!("Updating unit file {} on node {}", path, node.id);
        self.remote
            .write_file_on(node.id, &path, rendered.as_bytes(), WriteOptions::recursive())
            .await?;
        report.unit_file_changed = true;
        report.remote_writes += 1;

        report.mutating_commands += 1;
        self.run_checked(node, "systemctl daemon-reload").await?;
        Ok(())
    }

    async fn converge_enablement(
        &self,
        node: &Node,
        unit: &str,
        desired: bool,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        if self.unit_enabled(node, unit).await? == desired {
            return Ok(());
        }

        let action = if desired { "enable" } else { "disable" };
        tracing::info!("Unit {} on node {} has wrong state, running {}", unit, node.id, action);
        self.unit_command(node, action, unit).await?;
        report.mutating_commands += 1;
        report.enablement_changed = true;
        Ok(())
    }

    async fn unit_enabled(&self, node: &Node, unit: &str) -> Result<bool, ReconcileError> {
        let show = self.remote.run_command_on(node.id, &show_command(unit)).await?;
        if !show.success() {
            return Err(ReconcileError::ReconciliationFailed(format!(
                "could not query state of {} (exit {})",
                unit, show.exit_code
            )));
        }
        Ok(unit_file_state(&show.stdout) == Some("enabled"))
    }

    async fn unit_command(&self, node: &Node, action: &str, unit: &str) -> Result<(), ReconcileError> {
        self.run_checked(node, &format!("systemctl {} {}", action, unit))
            .await
            .map(|_| ())
    }

    /// Run a command that must exit with status 0
    async fn run_checked(&self, node: &Node, command: &str) -> Result<CommandOutput, ReconcileError> {
        let output = self.remote.run_command_on(node.id, command).await?;
        if !output.success() {
            return Err(ReconcileError::ReconciliationFailed(format!(
                "{} exited with {}: {}",
                command,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn record(&self, entry: ConnectionLog) {
        if let Err(e) = self.store.record_connection_log(entry).await {
            tracing::warn!("Failed to record connection log: {}", e);
        }
    }
}

/// Whether the deployment's stack should end up running
fn desired_enabled(node: &Node, target: &DeploymentTarget) -> bool {
    target.deployment.enabled && node.enabled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestFleet;
    use sc_core::time::current_time_millis;

    #[test]
    fn test_is_yaml_or_json() {
        assert!(is_yaml_or_json(b"services:\n  web:\n    image: nginx\n"));
        assert!(is_yaml_or_json(br#"{"services": {}}"#));
        assert!(!is_yaml_or_json(b"services: [unclosed"));
        assert!(!is_yaml_or_json(&[0xff, 0xfe, 0x00, 0x41]));
    }

    #[test]
    fn test_needs_reconciliation_new_deployment() {
        let fleet = TestFleet::new();
        let node = fleet.add_node("a", true);
        let target = fleet.add_deployment(&node, "web", "/srv/web", true);
        assert!(needs_reconciliation(&node, &target, Duration::from_secs(3600)));
    }

    #[test]
    fn test_needs_reconciliation_up_to_date() {
        let fleet = TestFleet::new();
        let node = fleet.add_node("a", true);
        let mut target = fleet.add_deployment(&node, "web", "/srv/web", true);
        target.deployment.last_check = Some(current_time_millis());
        target.deployment.last_deployed_as_enabled = Some(true);
        target.deployment.last_deployed_compose_version_id = Some(target.version.id);

        assert!(!needs_reconciliation(&node, &target, Duration::from_secs(3600)));

        // Stale check
        target.deployment.last_check = Some(current_time_millis() - 7_200_000);
        assert!(needs_reconciliation(&node, &target, Duration::from_secs(3600)));
    }

    #[test]
    fn test_needs_reconciliation_retries_failed_deployment() {
        let fleet = TestFleet::new();
        let node = fleet.add_node("a", true);
        let mut target = fleet.add_deployment(&node, "web", "/srv/web", true);
        target.deployment.last_check = Some(current_time_millis());
        target.deployment.last_deployed_as_enabled = Some(true);
        target.deployment.last_deployed_compose_version_id = Some(target.version.id);

        assert!(!needs_reconciliation(&node, &target, Duration::from_secs(3600)));

        target.deployment.reconciliation_failed = true;
        assert!(needs_reconciliation(&node, &target, Duration::from_secs(3600)));
    }

    #[test]
    fn test_needs_reconciliation_disabled_twice_is_skipped() {
        let fleet = TestFleet::new();
        let node = fleet.add_node("a", true);
        let mut target = fleet.add_deployment(&node, "web", "/srv/web", true);
        target.deployment.enabled = false;
        target.deployment.last_deployed_as_enabled = Some(false);
        target.deployment.last_check = Some(0);

        assert!(!needs_reconciliation(&node, &target, Duration::from_secs(3600)));

        target.deployment.last_deployed_as_enabled = Some(true);
        assert!(needs_reconciliation(&node, &target, Duration::from_secs(3600)));
    }
}
