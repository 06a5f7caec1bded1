//! Update dispatcher
//!
//! Decides when nodes are reconciled: a full sweep at startup and on every
//! `sweep_interval`, plus an immediate pass whenever a node change is
//! announced on the node update channel.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use sc_core::error::EventsError;
use sc_core::time::current_time_millis;
use sc_core::traits::{NodeEvents, Store};
use sc_core::NodeId;

use crate::events::parse_node_event;
use crate::lock::{LockCoordinator, LockOptions};
use crate::pool::SessionPool;
use crate::reconcile::{NodeReport, Reconciler};

/// Result of one scheduled attempt on a node
#[derive(Debug)]
pub enum PassOutcome {
    /// Deployments were reconciled (individually they may have failed)
    Completed(NodeReport),
    /// Another holder had the node's lock
    Skipped,
    /// The node was deleted or disabled
    NodeUnavailable,
    /// No session could be established
    Unreachable,
    /// The store or lock backend failed
    Failed(String),
    /// Shutdown interrupted the pass
    Cancelled,
}

impl PassOutcome {
    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            PassOutcome::Completed(_) => "completed",
            PassOutcome::Skipped => "skipped",
            PassOutcome::NodeUnavailable => "node unavailable",
            PassOutcome::Unreachable => "unreachable",
            PassOutcome::Failed(_) => "failed",
            PassOutcome::Cancelled => "cancelled",
        }
    }
}

/// Timings of the dispatch loop
#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    /// Interval between full sweeps
    pub sweep_interval: Duration,
    /// Delay before resubscribing to a closed event stream
    pub resubscribe_delay: Duration,
    /// Lock timings for each pass
    pub lock: LockOptions,
}

/// Schedules reconciliation passes
pub struct Dispatcher {
    store: Arc<dyn Store>,
    pool: Arc<SessionPool>,
    reconciler: Arc<Reconciler>,
    locks: LockCoordinator,
    events: Arc<dyn NodeEvents>,
    options: DispatchOptions,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<SessionPool>,
        reconciler: Arc<Reconciler>,
        locks: LockCoordinator,
        events: Arc<dyn NodeEvents>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            store,
            pool,
            reconciler,
            locks,
            events,
            options,
        }
    }

    /// Announce that a node's declared state changed
    pub async fn notify_node_changed(&self, node_id: NodeId) -> Result<(), EventsError> {
        self.events.publish(node_id).await
    }

    /// Run until `cancel` fires, then wait for in-flight passes and close
    /// every session.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut tasks: JoinSet<(NodeId, PassOutcome)> = JoinSet::new();
        let mut sweep = tokio::time::interval(self.options.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut events: Option<BoxStream<'static, String>> = None;
        let resubscribe = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(resubscribe);

        tracing::info!(
            "Dispatcher started (sweep interval: {:?})",
            self.options.sweep_interval
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!("Dispatcher shutting down");
                    break;
                }

                _ = &mut resubscribe, if events.is_none() => {
                    match self.events.subscribe().await {
                        Ok(stream) => {
                            tracing::info!("Subscribed to node updates");
                            events = Some(stream);
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Failed to subscribe to node updates: {}. Retrying in {:?}",
                                e,
                                self.options.resubscribe_delay
                            );
                            resubscribe.as_mut().reset(Instant::now() + self.options.resubscribe_delay);
                        }
                    }
                }

                payload = next_event(&mut events), if events.is_some() => match payload {
                    Some(payload) => match parse_node_event(&payload) {
                        Some(node_id) => {
                            tracing::debug!("Node update received for {}", node_id);
                            self.schedule(&mut tasks, node_id, true, &cancel);
                        }
                        None => tracing::warn!("Ignoring malformed node update {:?}", payload),
                    },
                    None => {
                        tracing::warn!(
                            "Node update stream closed, resubscribing in {:?}",
                            self.options.resubscribe_delay
                        );
                        events = None;
                        resubscribe.as_mut().reset(Instant::now() + self.options.resubscribe_delay);
                    }
                },

                _ = sweep.tick() => {
                    self.schedule_sweep(&mut tasks, &cancel).await;
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_joined(joined);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            log_joined(joined);
        }
        self.pool.shutdown().await;
        tracing::info!("Dispatcher stopped");
    }

    /// Run one full sweep and wait for every pass
    pub async fn sweep(self: &Arc<Self>) -> Vec<(NodeId, PassOutcome)> {
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        self.schedule_sweep(&mut tasks, &cancel).await;

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!("Reconciliation task failed: {}", e),
            }
        }
        outcomes
    }

    /// Lock, connect and reconcile one node.
    ///
    /// `force` bypasses the reconnect backoff.
    pub async fn run_pass(&self, node_id: NodeId, force: bool) -> PassOutcome {
        let lock = match self.locks.acquire(node_id, self.options.lock).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                tracing::debug!("Node {} is being processed elsewhere, skipping", node_id);
                return PassOutcome::Skipped;
            }
            Err(e) => {
                tracing::warn!("Failed to lock node {}: {}", node_id, e);
                return PassOutcome::Failed(e.to_string());
            }
        };

        let outcome = self.run_locked(node_id, force).await;

        if lock.is_lost() {
            tracing::warn!("Lock for node {} was lost during the pass", node_id);
        }
        if let Err(e) = lock.release().await {
            tracing::warn!("Failed to release lock for node {}: {}", node_id, e);
        }
        outcome
    }

    async fn run_locked(&self, node_id: NodeId, force: bool) -> PassOutcome {
        let node = match self.store.get_node(node_id).await {
            Ok(Some(node)) if node.enabled => node,
            Ok(_) => {
                tracing::debug!("Node {} is gone or disabled, dropping its session", node_id);
                self.pool.remove(node_id).await;
                return PassOutcome::NodeUnavailable;
            }
            Err(e) => {
                tracing::warn!("Failed to load node {}: {}", node_id, e);
                return PassOutcome::Failed(e.to_string());
            }
        };

        if let Err(e) = self.pool.ensure_connected(&node, force).await {
            tracing::debug!("Node {} unreachable: {}", node_id, e);
            if let Err(e) = self
                .store
                .update_node_last_check(node_id, current_time_millis(), true)
                .await
            {
                tracing::warn!("Failed to update node {}: {}", node_id, e);
            }
            return PassOutcome::Unreachable;
        }

        match self.reconciler.reconcile_node(&node).await {
            Ok(report) => {
                if let Err(e) = self
                    .store
                    .update_node_last_check(node_id, current_time_millis(), report.failed > 0)
                    .await
                {
                    tracing::warn!("Failed to update node {}: {}", node_id, e);
                }
                tracing::info!(
                    "Node {} reconciled: {} succeeded, {} failed, {} up to date",
                    node.name,
                    report.succeeded,
                    report.failed,
                    report.skipped
                );
                PassOutcome::Completed(report)
            }
            Err(e) => {
                tracing::warn!("Failed to list deployments of node {}: {}", node_id, e);
                PassOutcome::Failed(e.to_string())
            }
        }
    }

    fn schedule(
        self: &Arc<Self>,
        tasks: &mut JoinSet<(NodeId, PassOutcome)>,
        node_id: NodeId,
        force: bool,
        cancel: &CancellationToken,
    ) {
        let this = Arc::clone(self);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            // Dropping the pass on cancellation drops its lock, which
            // releases it in the background.
            let outcome = tokio::select! {
                outcome = this.run_pass(node_id, force) => outcome,
                _ = cancel.cancelled() => PassOutcome::Cancelled,
            };
            (node_id, outcome)
        });
    }

    async fn schedule_sweep(
        self: &Arc<Self>,
        tasks: &mut JoinSet<(NodeId, PassOutcome)>,
        cancel: &CancellationToken,
    ) {
        let nodes = match self.store.list_enabled_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!("Sweep skipped, failed to list nodes: {}", e);
                return;
            }
        };

        let enabled: HashSet<NodeId> = nodes.iter().map(|n| n.id).collect();
        self.pool.retain_enabled(&enabled).await;

        tracing::info!("Sweeping {} enabled nodes", nodes.len());
        for node in nodes {
            self.schedule(tasks, node.id, false, cancel);
        }
    }
}

async fn next_event(events: &mut Option<BoxStream<'static, String>>) -> Option<String> {
    match events.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

fn log_joined(joined: Result<(NodeId, PassOutcome), tokio::task::JoinError>) {
    match joined {
        Ok((node_id, outcome)) => {
            tracing::debug!("Pass for node {} {}", node_id, outcome.label());
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!("Reconciliation task failed: {}", e),
    }
}
