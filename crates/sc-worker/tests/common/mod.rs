//! Shared wiring for worker integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sc_core::config::BackoffConfig;
use sc_core::model::Node;
use sc_worker::events::MemoryNodeEvents;
use sc_worker::lock::MemoryLockBackend;
use sc_worker::reconcile::DEFAULT_COMPOSE_COMMAND;
use sc_worker::testing::{FakeConnector, FakeHost, TestFleet};
use sc_worker::{DispatchOptions, Dispatcher, LockCoordinator, LockOptions, Reconciler, SessionPool};

/// Fully wired worker over in-memory backends
pub struct Harness {
    pub fleet: TestFleet,
    pub connector: Arc<FakeConnector>,
    pub pool: Arc<SessionPool>,
    pub reconciler: Arc<Reconciler>,
    pub locks: Arc<MemoryLockBackend>,
    pub events: Arc<MemoryNodeEvents>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn lock_options() -> LockOptions {
    LockOptions {
        lease: Duration::from_secs(2),
        retry_interval: Duration::from_millis(10),
        retry_timeout: Duration::from_millis(50),
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_sweep_interval(Duration::from_secs(3600))
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        let fleet = TestFleet::new();
        let connector = Arc::new(FakeConnector::new());
        let pool = Arc::new(SessionPool::new(
            connector.clone(),
            fleet.codec.clone(),
            fleet.store.clone(),
            BackoffConfig {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(1),
                multiplier: 2.0,
                jitter: 0.0,
            },
        ));
        let reconciler = Arc::new(Reconciler::new(
            pool.clone(),
            fleet.store.clone(),
            DEFAULT_COMPOSE_COMMAND,
            Duration::from_secs(3600),
        ));
        let locks = Arc::new(MemoryLockBackend::new());
        let events = Arc::new(MemoryNodeEvents::new());
        let dispatcher = Arc::new(Dispatcher::new(
            fleet.store.clone(),
            pool.clone(),
            reconciler.clone(),
            LockCoordinator::new(locks.clone()),
            events.clone(),
            DispatchOptions {
                sweep_interval,
                resubscribe_delay: Duration::from_millis(20),
                lock: lock_options(),
            },
        ));

        Self {
            fleet,
            connector,
            pool,
            reconciler,
            locks,
            events,
            dispatcher,
        }
    }

    /// The simulated machine behind a node
    pub fn host(&self, node: &Node) -> Arc<FakeHost> {
        self.connector.host(&node.host)
    }
}
