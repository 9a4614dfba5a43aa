//! Passive side of a [`Netconn`]: bind, listen, accept.
//!
//! A listener is a handle in `Connecting` state that owns a port and an
//! accept queue. The stack reports clients through
//! [`EventBridge::on_accept`](crate::EventBridge::on_accept); each one is a
//! fully registered handle whose id waits in the accept queue until
//! `accept` hands it out.

use crate::error::{NetconnError, Result};
use crate::netconn::{timeout_ms, Netconn};
use crate::stack::{self, StackRequest};

use netconn_core::{ConnState, MessageQueue, PopError, QueueMessage};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

impl Netconn {
    /// Claim `port` for this handle.
    pub fn bind(&self, port: u16) -> Result<()> {
        let result = self.bind_inner(port);
        self.track(result)
    }

    fn bind_inner(&self, port: u16) -> Result<()> {
        let id = self.conn.id;
        let state = self.state();
        if state != ConnState::Idle {
            return Err(NetconnError::invalid_state("bind", state));
        }

        let registry = &self.netstack.shared.registry;
        registry.claim_port(port, id)?;
        if let Err(state) = self
            .conn
            .state
            .transition(ConnState::Idle, ConnState::Connecting)
        {
            registry.release_port(port, id);
            return Err(NetconnError::invalid_state("bind", state));
        }
        self.conn.set_local_port(port);
        debug!(conn = id, port, "Port bound");
        Ok(())
    }

    /// Start listening with the configured client limit.
    pub fn listen(&self) -> Result<()> {
        self.listen_with_max_conn(self.netstack.shared.config.max_listen_conns)
    }

    /// Start listening, refusing clients while `max_conns` accepted or
    /// pending clients of this listener exist.
    pub fn listen_with_max_conn(&self, max_conns: usize) -> Result<()> {
        let result = self.listen_inner(max_conns);
        self.track(result)
    }

    fn listen_inner(&self, max_conns: usize) -> Result<()> {
        let id = self.conn.id;
        let state = self.state();
        let port = match self.conn.local_port() {
            Some(port) if state == ConnState::Connecting && !self.conn.is_listener() => port,
            _ => return Err(NetconnError::invalid_state("listen", state)),
        };
        if max_conns == 0 {
            return Err(NetconnError::config("max_conns must be greater than 0"));
        }

        let config = &self.netstack.shared.config;
        self.conn.set_max_clients(max_conns);
        if self
            .conn
            .accept
            .set(MessageQueue::new(config.accept_queue_len))
            .is_err()
        {
            return Err(NetconnError::invalid_state("listen", state));
        }

        let result = stack::call(&*self.netstack.stack, |reply| StackRequest::Listen {
            id,
            conn_type: self.conn.conn_type,
            port,
            max_conns,
            idle_timeout: config.listen_idle_timeout,
            reply,
        });
        match result {
            Ok(()) => {
                info!(conn = id, port, max_conns, "Listening");
                Ok(())
            }
            Err(e) => {
                self.conn.state.force_closed();
                self.conn.rx.close();
                if let Some(queue) = self.conn.accept.get() {
                    queue.close();
                }
                self.release_port();
                warn!(conn = id, port, error = %e, "Listen failed");
                Err(e)
            }
        }
    }

    /// Wait for the next client using the handle's receive timeout.
    pub fn accept(&self) -> Result<Netconn> {
        self.accept_for(self.receive_timeout())
    }

    /// Wait up to `timeout` for the next client. Clients come out in the
    /// order the stack reported them and may already hold received data.
    pub fn accept_for(&self, timeout: Option<Duration>) -> Result<Netconn> {
        let result = self.accept_inner(timeout);
        self.track(result)
    }

    fn accept_inner(&self, timeout: Option<Duration>) -> Result<Netconn> {
        let Some(queue) = self.conn.accept.get() else {
            return Err(NetconnError::invalid_state("accept", self.state()));
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match queue.pop(remaining) {
                Ok(QueueMessage::Data(client_id)) => {
                    let Some(client) = self.netstack.shared.registry.get(client_id) else {
                        trace!(conn = client_id, "Skipping client evicted before accept");
                        continue;
                    };
                    client.take_ownership();
                    debug!(
                        listener = self.conn.id,
                        conn = client_id,
                        pending = client.rx.len(),
                        "Client accepted"
                    );
                    let accepted = Netconn::from_conn(self.netstack.clone(), client);
                    accepted.set_receive_timeout(self.receive_timeout());
                    return Ok(accepted);
                }
                Ok(QueueMessage::Closed) | Ok(QueueMessage::Reset) => {
                    return Err(NetconnError::closed())
                }
                Err(PopError::Timeout) => {
                    return Err(NetconnError::timeout(timeout_ms(timeout)))
                }
            }
        }
    }

    /// Clients reported by the stack and not yet accepted.
    pub fn pending_accepts(&self) -> usize {
        self.conn.accept.get().map_or(0, MessageQueue::len)
    }

    /// Stop listening, give the port back and drop every unaccepted client.
    pub(crate) fn close_listener(&self) {
        let id = self.conn.id;
        let shared = &self.netstack.shared;
        let prev = self.conn.state.force_closed();
        self.conn.rx.close();

        let port = self.conn.local_port();
        if let Some(port) = port {
            if prev != ConnState::Closed {
                let _ = self.netstack.stack.submit(StackRequest::Unlisten { id, port });
            }
            shared.registry.release_port(port, id);
        }

        let Some(queue) = self.conn.accept.get() else {
            return;
        };
        queue.close();
        let pending = queue.drain();
        let dropped = pending.len();
        for client_id in pending {
            if let Some(client) = shared.registry.remove(client_id) {
                client.state.force_closed();
                let discarded = client.discard_pending();
                shared.metrics.buffers_discarded(discarded);
                let _ = self
                    .netstack
                    .stack
                    .submit(StackRequest::Abort { id: client_id });
            }
        }

        if prev != ConnState::Closed {
            info!(conn = id, ?port, dropped, "Listener closed");
        }
    }
}
