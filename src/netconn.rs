//! Blocking connection handle

use crate::config::ConnType;
use crate::error::{ConnectionError, NetconnError, Result, Status};
use crate::netstack::Netstack;
use crate::registry::{Conn, ConnId};
use crate::stack::{self, StackRequest};

use bytes::{Bytes, BytesMut};
use netconn_core::{ConnState, Pbuf, PopError, QueueMessage, Terminal};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Sequential connection API over an event-driven stack.
///
/// Every method blocks the calling thread at most until the stack answers or
/// the handle's timeout elapses; none of them may run inside an async
/// runtime. A `Netconn` can be shared between threads (`&self` methods), but
/// only one thread should wait in `receive` or `accept` at a time.
pub struct Netconn {
    pub(crate) netstack: Netstack,
    pub(crate) conn: Arc<Conn>,
    write_buf: Mutex<BytesMut>,
    receive_timeout: Mutex<Option<Duration>>,
}

impl Netconn {
    pub(crate) fn from_conn(netstack: Netstack, conn: Arc<Conn>) -> Self {
        let receive_timeout = netstack.shared.config.receive_timeout;
        Self {
            netstack,
            conn,
            write_buf: Mutex::new(BytesMut::new()),
            receive_timeout: Mutex::new(receive_timeout),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn conn_id(&self) -> ConnId {
        self.conn.id
    }

    pub fn conn_type(&self) -> ConnType {
        self.conn.conn_type
    }

    pub fn state(&self) -> ConnState {
        self.conn.state.get()
    }

    /// Port claimed by `bind`, or the listener port of an accepted client.
    pub fn local_port(&self) -> Option<u16> {
        self.conn.local_port()
    }

    /// Remote address of an accepted client, when the stack reported one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer.get().copied()
    }

    /// Status of the most recent failed call, or of the end of stream.
    pub fn last_error(&self) -> Option<Status> {
        match self.conn.last_status() {
            Status::Ok => None,
            status => Some(status),
        }
    }

    /// Timeout for `receive` and `accept`. `None` or zero blocks forever.
    pub fn set_receive_timeout(&self, timeout: Option<Duration>) {
        *self.receive_timeout.lock() = timeout.filter(|t| !t.is_zero());
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        *self.receive_timeout.lock()
    }

    /// Bytes written but not yet handed to the stack.
    pub fn pending_write(&self) -> usize {
        self.write_buf.lock().len()
    }

    /// Buffers waiting to be received.
    pub fn pending_receive(&self) -> usize {
        self.conn.rx.len()
    }

    pub fn uptime(&self) -> Duration {
        self.conn.created_at.elapsed()
    }

    // ── Connect ─────────────────────────────────────────────────────────

    /// Open a connection to `host:port` and wait until the stack reports it
    /// established, refused, or timed out.
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        let result = self.connect_inner(host, port);
        self.track(result)
    }

    fn connect_inner(&self, host: &str, port: u16) -> Result<()> {
        let id = self.conn.id;
        self.conn
            .state
            .transition(ConnState::Idle, ConnState::Connecting)
            .map_err(|state| NetconnError::invalid_state("connect", state))?;

        debug!(conn = id, host, port, "Connecting");
        let timeout = self.netstack.shared.config.connect_timeout;
        let result = stack::call(&*self.netstack.stack, |reply| StackRequest::Connect {
            id,
            conn_type: self.conn.conn_type,
            host: host.to_owned(),
            port,
            timeout,
            reply,
        });

        match result {
            Ok(()) => {
                let established = self
                    .conn
                    .state
                    .transition(ConnState::Connecting, ConnState::Connected);
                // A terminal latched before the transition was reported while
                // the handle was still connecting; later ones advance the state.
                match (established, self.conn.rx.terminal()) {
                    (Ok(()), None) => {
                        info!(conn = id, host, port, "Connection established");
                        Ok(())
                    }
                    (_, terminal) => {
                        let prev = self.conn.state.force_closed();
                        debug!(conn = id, state = %prev, ?terminal, "Connection ended while establishing");
                        let _ = self.netstack.stack.submit(StackRequest::Abort { id });
                        Err(self.end_of_stream())
                    }
                }
            }
            Err(e) => {
                self.conn.state.force_closed();
                let discarded = self.conn.discard_pending();
                self.netstack.shared.metrics.buffers_discarded(discarded);
                warn!(conn = id, host, port, error = %e, "Connect failed");
                Err(e)
            }
        }
    }

    // ── Write path ──────────────────────────────────────────────────────

    /// Buffer `data`, sending every full threshold-sized chunk. Blocks only
    /// while the stack acknowledges those chunks.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let result = self.write_inner(data);
        self.track(result)
    }

    fn write_inner(&self, data: &[u8]) -> Result<()> {
        if self.conn.conn_type == ConnType::Datagram {
            return Err(NetconnError::invalid_state(
                "write to a datagram connection",
                self.state(),
            ));
        }
        self.ensure_writable("write")?;

        let threshold = self.netstack.shared.config.write_flush_threshold;
        let mut buf = self.write_buf.lock();
        buf.extend_from_slice(data);
        while buf.len() >= threshold {
            let chunk = buf.split_to(threshold).freeze();
            self.send_chunk(chunk)?;
        }
        Ok(())
    }

    /// Send everything buffered by `write` and wait for the acknowledgement.
    pub fn flush(&self) -> Result<()> {
        let result = self.flush_inner();
        self.track(result)
    }

    fn flush_inner(&self) -> Result<()> {
        let mut buf = self.write_buf.lock();
        if buf.is_empty() {
            return Ok(());
        }
        self.ensure_writable("flush")?;
        let chunk = buf.split().freeze();
        self.send_chunk(chunk)
    }

    /// Send one datagram. Only valid on [`ConnType::Datagram`] handles.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let result = self.send_inner(data);
        self.track(result)
    }

    fn send_inner(&self, data: &[u8]) -> Result<()> {
        if self.conn.conn_type != ConnType::Datagram {
            return Err(NetconnError::invalid_state(
                "send a datagram on a stream connection",
                self.state(),
            ));
        }
        self.ensure_writable("send")?;
        self.send_chunk(Bytes::copy_from_slice(data))
    }

    fn send_chunk(&self, data: Bytes) -> Result<()> {
        let id = self.conn.id;
        let len = data.len();
        stack::call(&*self.netstack.stack, |reply| StackRequest::Send {
            id,
            data,
            reply,
        })?;
        trace!(conn = id, len, "Sent");
        Ok(())
    }

    fn ensure_writable(&self, op: &'static str) -> Result<()> {
        match self.state() {
            ConnState::Connected => Ok(()),
            ConnState::Closing | ConnState::Closed => Err(self.end_of_stream()),
            state if self.conn.is_listener() => Err(NetconnError::invalid_state(op, state)),
            _ => Err(NetconnError::connection(ConnectionError::NotConnected)),
        }
    }

    fn end_of_stream(&self) -> NetconnError {
        match self.conn.rx.terminal() {
            Some(Terminal::Reset) => NetconnError::reset(),
            _ => NetconnError::closed(),
        }
    }

    // ── Receive ─────────────────────────────────────────────────────────

    /// Wait for the next buffer using the handle's receive timeout.
    ///
    /// `Ok(None)` is the graceful end of stream and repeats on every later
    /// call. A reset surfaces as `Connection { Reset }`.
    pub fn receive(&self) -> Result<Option<Pbuf>> {
        self.receive_for(self.receive_timeout())
    }

    /// Like [`receive`](Self::receive) with an explicit timeout.
    pub fn receive_for(&self, timeout: Option<Duration>) -> Result<Option<Pbuf>> {
        let result = self.receive_inner(timeout);
        if let Ok(None) = result {
            self.conn.record(Status::Closed);
        }
        self.track(result)
    }

    fn receive_inner(&self, timeout: Option<Duration>) -> Result<Option<Pbuf>> {
        let state = self.state();
        let bound = state == ConnState::Connecting && self.conn.local_port().is_some();
        if state == ConnState::Idle || bound || self.conn.is_listener() {
            return Err(NetconnError::invalid_state("receive", state));
        }

        match self.conn.rx.pop(timeout) {
            Ok(QueueMessage::Data(pbuf)) => {
                trace!(conn = self.conn.id, len = pbuf.len(), "Received");
                Ok(Some(pbuf))
            }
            Ok(QueueMessage::Closed) => Ok(None),
            Ok(QueueMessage::Reset) => Err(NetconnError::reset()),
            Err(PopError::Timeout) => Err(NetconnError::timeout(timeout_ms(timeout))),
        }
    }

    // ── Close / delete ──────────────────────────────────────────────────

    /// Flush pending writes and close the connection. A listener stops
    /// listening and drops every client nobody accepted. Safe to call more
    /// than once, and from another thread to wake a blocked `receive`.
    pub fn close(&self) -> Result<()> {
        let result = if self.conn.is_listener() {
            self.close_listener();
            Ok(())
        } else {
            self.close_connection()
        };
        self.track(result)
    }

    fn close_connection(&self) -> Result<()> {
        let id = self.conn.id;
        match self.state() {
            ConnState::Closed => {
                self.conn.rx.close();
                Ok(())
            }
            ConnState::Idle => {
                let _ = self.conn.state.advance(ConnState::Closed);
                self.conn.rx.close();
                debug!(conn = id, "Idle connection closed");
                Ok(())
            }
            ConnState::Connecting => {
                // Bound but never listening, or a connect still in flight.
                self.conn.state.force_closed();
                self.conn.rx.close();
                self.release_port();
                let _ = self.netstack.stack.submit(StackRequest::Abort { id });
                debug!(conn = id, "Connection closed before it was established");
                Ok(())
            }
            ConnState::Connected | ConnState::Closing => {
                let flushed = self.flush_inner();
                let _ = self.conn.state.advance(ConnState::Closing);
                self.conn.rx.close();
                let closed = stack::call(&*self.netstack.stack, |reply| StackRequest::Close {
                    id,
                    reply: Some(reply),
                });
                let _ = self.conn.state.advance(ConnState::Closed);
                info!(conn = id, "Connection closed");
                flushed.and(closed)
            }
        }
    }

    /// Destroy the handle, releasing every buffer it still holds. Same as
    /// dropping it.
    pub fn delete(self) {
        drop(self);
    }

    pub(crate) fn release_port(&self) {
        if let Some(port) = self.conn.local_port() {
            self.netstack.shared.registry.release_port(port, self.conn.id);
        }
    }

    pub(crate) fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.conn.record(e.status());
        }
        result
    }
}

pub(crate) fn timeout_ms(timeout: Option<Duration>) -> u64 {
    timeout.map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
}

impl Drop for Netconn {
    fn drop(&mut self) {
        let id = self.conn.id;
        let state = self.state();
        if self.conn.is_listener() {
            self.close_listener();
        } else if !state.is_destroyable() {
            debug!(conn = id, %state, "Deleting open connection, aborting");
            self.conn.state.force_closed();
            let _ = self.netstack.stack.submit(StackRequest::Abort { id });
        }

        let discarded = self.conn.discard_pending();
        self.netstack.shared.metrics.buffers_discarded(discarded);
        self.release_port();
        self.netstack.shared.registry.remove(id);
        debug!(conn = id, discarded, "Connection deleted");
    }
}

impl fmt::Debug for Netconn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Netconn")
            .field("id", &self.conn.id)
            .field("type", &self.conn.conn_type)
            .field("state", &self.state())
            .field("local_port", &self.local_port())
            .field("pending_receive", &self.pending_receive())
            .finish()
    }
}
