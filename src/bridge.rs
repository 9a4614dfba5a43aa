//! Entry point for the stack's event context.
//!
//! Every method here runs on the stack's side and must return promptly: no
//! method waits on a consumer thread, takes a lock a consumer may hold for
//! long, or allocates beyond a new handle. Failures never surface as errors;
//! they become queue terminals and state changes that consumers observe.
//!
//! ```text
//!   stack event ──► EventBridge ──► Conn.rx / listener.accept ──► consumer
//!                        │
//!                        └──► Delivery verdict back to the stack
//! ```

use crate::config::NetconnConfig;
use crate::error::Status;
use crate::metrics::Metrics;
use crate::registry::{ConnId, Registry};

use netconn_core::{ConnState, Pbuf, PushError};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// State reachable from both the consumer side and the event context.
pub(crate) struct Shared {
    pub(crate) registry: Registry,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) config: NetconnConfig,
}

impl Shared {
    pub(crate) fn new(config: NetconnConfig) -> Self {
        let metrics = Arc::new(Metrics::default());
        Self {
            registry: Registry::new(config.max_connections, metrics.clone()),
            metrics,
            config,
        }
    }
}

/// Outcome of handing a received buffer to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The buffer is waiting for the consumer.
    Queued,
    /// The connection already ended; the buffer was released.
    Discarded,
    /// The consumer fell behind. The buffer was released and the connection
    /// reset; the stack should abort it.
    Overflow,
    /// No such connection; the buffer was released.
    Unknown,
}

impl Delivery {
    /// Whether the stack should stop reading from the connection.
    pub fn should_abort(self) -> bool {
        !matches!(self, Delivery::Queued)
    }
}

/// Handle given to the stack for reporting events.
#[derive(Clone)]
pub struct EventBridge {
    shared: Arc<Shared>,
}

impl EventBridge {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Data arrived for `id`. Takes over the buffer's reference.
    pub fn on_data(&self, id: ConnId, pbuf: Pbuf) -> Delivery {
        let Some(conn) = self.shared.registry.get(id) else {
            trace!(conn = id, len = pbuf.len(), "Data for unknown connection dropped");
            let _ = pbuf.release();
            return Delivery::Unknown;
        };

        let len = pbuf.len();
        match conn.rx.push_data(pbuf) {
            Ok(()) => {
                self.shared.metrics.bytes_received(len);
                trace!(conn = id, len, "Data queued");
                Delivery::Queued
            }
            Err(PushError::Closed(pbuf)) => {
                let _ = pbuf.release();
                self.shared.metrics.buffers_discarded(1);
                debug!(conn = id, len, "Data after end of stream discarded");
                Delivery::Discarded
            }
            Err(PushError::Full(pbuf)) => {
                let _ = pbuf.release();
                conn.rx.reset();
                conn.state.force_closed();
                conn.record(Status::Reset);
                self.shared.metrics.overflow_reset();
                warn!(
                    conn = id,
                    len,
                    capacity = conn.rx.capacity(),
                    "Receive queue overflow, resetting connection"
                );
                Delivery::Overflow
            }
        }
    }

    /// The peer closed its side gracefully.
    pub fn on_remote_closed(&self, id: ConnId) {
        let Some(conn) = self.shared.registry.get(id) else {
            return;
        };
        conn.rx.close();
        if conn.state.advance(ConnState::Closing).is_ok() {
            conn.record(Status::Closed);
        }
        info!(conn = id, state = %conn.state.get(), "Connection closed by peer");
    }

    /// The connection was torn down abruptly.
    pub fn on_reset(&self, id: ConnId) {
        let Some(conn) = self.shared.registry.get(id) else {
            return;
        };
        if conn.rx.reset() {
            conn.record(Status::Reset);
        }
        let _ = conn.state.advance(ConnState::Closed);
        info!(conn = id, "Connection reset");
    }

    /// A send for `id` was acknowledged by the stack.
    pub fn on_sent(&self, id: ConnId, len: usize) {
        self.shared.metrics.bytes_sent(len);
        trace!(conn = id, len, "Send acknowledged");
    }

    /// A client connected to `port`. Returns the new handle's id, already
    /// waiting in the listener's accept queue, or `None` when the client
    /// must be refused.
    pub fn on_accept(&self, port: u16, peer: Option<SocketAddr>) -> Option<ConnId> {
        let id = self.begin_accept(port, peer)?;
        self.publish_accept(id).then_some(id)
    }

    /// First half of [`on_accept`](Self::on_accept): allocate the client
    /// handle without making it visible to `accept`. Data may be delivered
    /// to it right away.
    pub fn begin_accept(&self, port: u16, peer: Option<SocketAddr>) -> Option<ConnId> {
        let listener = match self.shared.registry.listener_on(port) {
            Some(l)
                if l.state.get() == ConnState::Connecting
                    && l.accept.get().is_some_and(|q| q.terminal().is_none()) =>
            {
                l
            }
            _ => {
                self.shared.metrics.connection_refused();
                debug!(port, ?peer, "No listener, refusing client");
                return None;
            }
        };

        if !listener.try_add_client() {
            self.shared.metrics.connection_refused();
            warn!(
                port,
                ?peer,
                clients = listener.client_count(),
                "Listener at max connections, refusing client"
            );
            return None;
        }

        let conn = match self.shared.registry.insert(
            listener.conn_type,
            ConnState::Connected,
            self.shared.config.receive_queue_len,
            Some(&listener),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                listener.release_client();
                self.shared.metrics.connection_refused();
                warn!(port, ?peer, error = %e, "Refusing client");
                return None;
            }
        };

        conn.set_local_port(port);
        if let Some(peer) = peer {
            let _ = conn.peer.set(peer);
        }
        Some(conn.id)
    }

    /// Second half of [`on_accept`](Self::on_accept): queue a client from
    /// [`begin_accept`](Self::begin_accept) for `accept`. On `false` the
    /// handle is gone and the stack must drop the client.
    pub fn publish_accept(&self, id: ConnId) -> bool {
        let Some(conn) = self.shared.registry.get(id) else {
            return false;
        };

        let pushed = conn
            .parent()
            .and_then(|listener| listener.accept.get().map(|q| q.push_data(id)));
        match pushed {
            Some(Ok(())) => {
                self.shared.metrics.connection_accepted();
                info!(
                    conn = id,
                    port = conn.local_port().unwrap_or(0),
                    peer = ?conn.peer.get(),
                    "Client queued for accept"
                );
                true
            }
            Some(Err(e)) => {
                warn!(conn = id, full = e.is_full(), "Accept queue rejected client");
                self.refuse(id);
                false
            }
            None => {
                debug!(conn = id, "Listener gone before client was queued");
                self.refuse(id);
                false
            }
        }
    }

    fn refuse(&self, id: ConnId) {
        if let Some(conn) = self.shared.registry.remove(id) {
            conn.state.force_closed();
            let discarded = conn.discard_pending();
            self.shared.metrics.buffers_discarded(discarded);
        }
        self.shared.metrics.connection_refused();
    }
}
