//! Seam between the blocking facade and the network stack.
//!
//! The [`Stack`] trait is the outbound half: consumer threads hand requests
//! to the stack without blocking on it. The inbound half is the
//! [`EventBridge`](crate::EventBridge), which the stack calls from its event
//! context. Enable the `runtime-tokio` feature (on by default) for the
//! built-in [`TokioStack`](crate::TokioStack).

use crate::config::ConnType;
use crate::error::{NetconnError, Result};
use crate::registry::ConnId;

use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;

/// Completion channel for a request the caller waits on.
pub type Reply = oneshot::Sender<Result<()>>;

/// Work submitted to the stack by consumer threads.
pub enum StackRequest {
    /// Open an outbound connection. The stack answers once it is established,
    /// refused, or `timeout` elapsed.
    Connect {
        id: ConnId,
        conn_type: ConnType,
        host: String,
        port: u16,
        timeout: Duration,
        reply: Reply,
    },
    /// Start accepting clients on `port`, reporting each through
    /// [`EventBridge::on_accept`](crate::EventBridge::on_accept).
    Listen {
        id: ConnId,
        conn_type: ConnType,
        port: u16,
        max_conns: usize,
        idle_timeout: Option<Duration>,
        reply: Reply,
    },
    Unlisten {
        id: ConnId,
        port: u16,
    },
    /// Transmit `data`. The reply is the acknowledgement the writer waits on.
    Send {
        id: ConnId,
        data: Bytes,
        reply: Reply,
    },
    /// Graceful shutdown
    Close {
        id: ConnId,
        reply: Option<Reply>,
    },
    /// Drop the connection immediately
    Abort {
        id: ConnId,
    },
}

impl StackRequest {
    pub fn conn_id(&self) -> ConnId {
        match self {
            Self::Connect { id, .. }
            | Self::Listen { id, .. }
            | Self::Unlisten { id, .. }
            | Self::Send { id, .. }
            | Self::Close { id, .. }
            | Self::Abort { id } => *id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Listen { .. } => "listen",
            Self::Unlisten { .. } => "unlisten",
            Self::Send { .. } => "send",
            Self::Close { .. } => "close",
            Self::Abort { .. } => "abort",
        }
    }
}

impl fmt::Debug for StackRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("StackRequest");
        d.field("op", &self.name()).field("conn", &self.conn_id());
        match self {
            Self::Connect { host, port, .. } => d.field("host", host).field("port", port),
            Self::Listen { port, max_conns, .. } => {
                d.field("port", port).field("max_conns", max_conns)
            }
            Self::Unlisten { port, .. } => d.field("port", port),
            Self::Send { data, .. } => d.field("len", &data.len()),
            Self::Close { .. } | Self::Abort { .. } => &mut d,
        };
        d.finish()
    }
}

/// Network stack driven by the blocking facade.
///
/// `submit` must not block: it runs on consumer threads that may hold a
/// connection's write buffer, and on `Drop` paths. Answers come back through
/// the request's [`Reply`], inbound traffic through the
/// [`EventBridge`](crate::EventBridge).
pub trait Stack: Send + Sync + 'static {
    fn submit(&self, request: StackRequest) -> Result<()>;
}

impl<S: Stack + ?Sized> Stack for std::sync::Arc<S> {
    fn submit(&self, request: StackRequest) -> Result<()> {
        (**self).submit(request)
    }
}

/// Submit a request built around a fresh reply channel and block until the
/// stack answers. Must not be called from inside an async runtime.
pub(crate) fn call(stack: &dyn Stack, make: impl FnOnce(Reply) -> StackRequest) -> Result<()> {
    let (reply, rx) = oneshot::channel();
    stack.submit(make(reply))?;
    rx.blocking_recv()
        .unwrap_or_else(|_| Err(NetconnError::stack("stack dropped the request")))
}
