//! Connection table shared by the event context and consumer threads.

use crate::config::ConnType;
use crate::error::{NetconnError, Result, Status};
use crate::metrics::Metrics;
use netconn_core::{ConnState, MessageQueue, Pbuf, StateCell};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;
use tracing::{debug, trace};

/// Identity of a connection handle, unique for the lifetime of a
/// [`Netstack`](crate::Netstack).
pub type ConnId = u32;

/// State of one connection shared between its [`Netconn`](crate::Netconn)
/// and the [`EventBridge`](crate::EventBridge).
pub(crate) struct Conn {
    pub(crate) id: ConnId,
    pub(crate) conn_type: ConnType,
    pub(crate) state: StateCell,
    pub(crate) rx: MessageQueue<Pbuf>,
    /// Present once the handle listens.
    pub(crate) accept: OnceLock<MessageQueue<ConnId>>,
    pub(crate) peer: OnceLock<SocketAddr>,
    local_port: AtomicU16,
    last_status: AtomicU8,
    /// Handed to the application, either by `create` or by `accept`.
    owned: AtomicBool,
    /// Listener this client arrived on.
    parent: Option<Weak<Conn>>,
    /// Clients of this listener that still exist.
    clients: AtomicUsize,
    max_clients: AtomicUsize,
    pub(crate) created_at: Instant,
}

impl Conn {
    fn new(
        id: ConnId,
        conn_type: ConnType,
        state: ConnState,
        queue_len: usize,
        parent: Option<&Arc<Conn>>,
    ) -> Self {
        Self {
            id,
            conn_type,
            state: StateCell::new(state),
            rx: MessageQueue::new(queue_len),
            accept: OnceLock::new(),
            peer: OnceLock::new(),
            local_port: AtomicU16::new(0),
            last_status: AtomicU8::new(Status::Ok as u8),
            owned: AtomicBool::new(parent.is_none()),
            parent: parent.map(Arc::downgrade),
            clients: AtomicUsize::new(0),
            max_clients: AtomicUsize::new(usize::MAX),
            created_at: Instant::now(),
        }
    }

    pub(crate) fn local_port(&self) -> Option<u16> {
        match self.local_port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    pub(crate) fn set_local_port(&self, port: u16) {
        self.local_port.store(port, Ordering::Release);
    }

    pub(crate) fn is_listener(&self) -> bool {
        self.accept.get().is_some()
    }

    pub(crate) fn is_owned(&self) -> bool {
        self.owned.load(Ordering::Acquire)
    }

    pub(crate) fn take_ownership(&self) {
        self.owned.store(true, Ordering::Release);
    }

    pub(crate) fn last_status(&self) -> Status {
        Status::from_u8(self.last_status.load(Ordering::Acquire))
    }

    pub(crate) fn record(&self, status: Status) {
        self.last_status.store(status as u8, Ordering::Release);
    }

    /// Listener this client arrived on, while it still exists.
    pub(crate) fn parent(&self) -> Option<Arc<Conn>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_max_clients(&self, max: usize) {
        self.max_clients.store(max, Ordering::Release);
    }

    /// Reserve a client slot on this listener.
    pub(crate) fn try_add_client(&self) -> bool {
        let max = self.max_clients.load(Ordering::Acquire);
        self.clients
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    /// Give back a slot taken by `try_add_client`.
    pub(crate) fn release_client(&self) {
        let _ = self
            .clients
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn client_count(&self) -> usize {
        self.clients.load(Ordering::Acquire)
    }

    /// Stop the queue and release every buffer still waiting in it.
    pub(crate) fn discard_pending(&self) -> usize {
        self.rx.close();
        let leftovers = self.rx.drain();
        let n = leftovers.len();
        for pbuf in leftovers {
            let _ = pbuf.release();
        }
        n
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.release_client();
        }
    }
}

/// Sharded table of live connections plus the port claims of bound handles.
pub(crate) struct Registry {
    conns: DashMap<ConnId, Arc<Conn>>,
    ports: DashMap<u16, ConnId>,
    next_id: AtomicU32,
    count: AtomicUsize,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl Registry {
    pub(crate) fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            conns: DashMap::new(),
            ports: DashMap::new(),
            next_id: AtomicU32::new(1),
            count: AtomicUsize::new(0),
            capacity,
            metrics,
        }
    }

    /// Allocate a handle. When the table is full, clients that were closed
    /// before anyone accepted them are evicted to make room.
    pub(crate) fn insert(
        &self,
        conn_type: ConnType,
        state: ConnState,
        queue_len: usize,
        parent: Option<&Arc<Conn>>,
    ) -> Result<Arc<Conn>> {
        if !self.reserve_slot() && (self.evict_orphans() == 0 || !self.reserve_slot()) {
            return Err(NetconnError::exhausted(format!(
                "connection table full ({} handles)",
                self.capacity
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Conn::new(id, conn_type, state, queue_len, parent));
        self.conns.insert(id, conn.clone());
        self.metrics.connection_created();
        trace!(conn = id, %conn_type, %state, "Connection registered");
        Ok(conn)
    }

    fn reserve_slot(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    pub(crate) fn get(&self, id: ConnId) -> Option<Arc<Conn>> {
        self.conns.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn remove(&self, id: ConnId) -> Option<Arc<Conn>> {
        let (_, conn) = self.conns.remove(&id)?;
        self.count.fetch_sub(1, Ordering::AcqRel);
        self.metrics.connection_closed();
        trace!(conn = id, "Connection unregistered");
        Some(conn)
    }

    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Claim `port` for `id`.
    pub(crate) fn claim_port(&self, port: u16, id: ConnId) -> Result<()> {
        match self.ports.entry(port) {
            Entry::Occupied(owner) if *owner.get() != id => Err(NetconnError::PortInUse { port }),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok(())
            }
        }
    }

    /// Release `port` if `id` still owns it.
    pub(crate) fn release_port(&self, port: u16, id: ConnId) {
        self.ports.remove_if(&port, |_, owner| *owner == id);
    }

    /// The listener that owns `port`, if any.
    pub(crate) fn listener_on(&self, port: u16) -> Option<Arc<Conn>> {
        let id = *self.ports.get(&port)?;
        self.get(id).filter(|conn| conn.is_listener())
    }

    /// Drop clients that finished before the application accepted them.
    /// Their ids stay in the accept queue and are skipped by `accept`.
    pub(crate) fn evict_orphans(&self) -> usize {
        let orphans: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|entry| {
                let conn = entry.value();
                !conn.is_owned()
                    && matches!(conn.state.get(), ConnState::Closing | ConnState::Closed)
            })
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for id in orphans {
            if let Some(conn) = self.remove(id) {
                let discarded = conn.discard_pending();
                self.metrics.buffers_discarded(discarded);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "Evicted unaccepted closed connections");
        }
        evicted
    }
}
