//! Owner of the connection table and the stack a set of handles share.

use crate::bridge::{EventBridge, Shared};
use crate::config::{ConnType, NetconnConfig};
use crate::error::Result;
use crate::metrics::MetricsSnapshot;
use crate::netconn::Netconn;
use crate::stack::Stack;

use netconn_core::ConnState;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Factory for [`Netconn`] handles bound to one network stack.
///
/// Cheap to clone; every handle keeps its `Netstack` alive.
#[derive(Clone)]
pub struct Netstack {
    pub(crate) shared: Arc<Shared>,
    pub(crate) stack: Arc<dyn Stack>,
}

impl Netstack {
    /// Build a netstack around a stack that reports its events through the
    /// given [`EventBridge`].
    ///
    /// ```ignore
    /// let netstack = Netstack::with_stack(NetconnConfig::default(), |bridge| {
    ///     MyStack::new(bridge)
    /// })?;
    /// ```
    pub fn with_stack<S, F>(config: NetconnConfig, make_stack: F) -> Result<Self>
    where
        S: Stack,
        F: FnOnce(EventBridge) -> S,
    {
        config.validate()?;
        let shared = Arc::new(Shared::new(config));
        let stack = make_stack(EventBridge::new(shared.clone()));
        info!(
            max_connections = shared.config.max_connections,
            receive_queue_len = shared.config.receive_queue_len,
            "Netstack started"
        );
        Ok(Self {
            shared,
            stack: Arc::new(stack),
        })
    }

    /// Netstack backed by a [`TokioStack`](crate::TokioStack) on `handle`.
    #[cfg(feature = "runtime-tokio")]
    pub fn tokio(config: NetconnConfig, handle: &tokio::runtime::Handle) -> Result<Self> {
        Self::with_stack(config, |bridge| crate::TokioStack::spawn(handle, bridge))
    }

    /// A further bridge onto the same connection table.
    pub fn bridge(&self) -> EventBridge {
        EventBridge::new(self.shared.clone())
    }

    /// Allocate an idle handle of the given type.
    pub fn create(&self, conn_type: ConnType) -> Result<Netconn> {
        let conn = self.shared.registry.insert(
            conn_type,
            ConnState::Idle,
            self.shared.config.receive_queue_len,
            None,
        )?;
        debug!(conn = conn.id, %conn_type, "Connection created");
        Ok(Netconn::from_conn(self.clone(), conn))
    }

    /// Allocate an idle handle of the configured default type.
    pub fn create_default(&self) -> Result<Netconn> {
        self.create(self.shared.config.conn_type)
    }

    /// Handles currently registered, accepted or not.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn config(&self) -> &NetconnConfig {
        &self.shared.config
    }
}

impl fmt::Debug for Netstack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Netstack")
            .field("connections", &self.connection_count())
            .field("config", &self.shared.config)
            .finish()
    }
}
