//! Configuration types for netconn

use crate::error::{NetconnError, Result};
use std::fmt;
use std::time::Duration;

/// Largest chunk a single stack send may carry.
pub const MAX_WRITE_CHUNK: usize = 64 * 1024;

/// Transport flavour of a connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    /// Reliable byte stream (TCP)
    Stream,
    /// Unreliable datagrams (UDP)
    Datagram,
    /// Stream secured by the stack (TLS)
    EncryptedStream,
}

impl ConnType {
    pub fn is_stream(self) -> bool {
        matches!(self, ConnType::Stream | ConnType::EncryptedStream)
    }
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnType::Stream => "stream",
            ConnType::Datagram => "datagram",
            ConnType::EncryptedStream => "encrypted-stream",
        };
        f.write_str(s)
    }
}

/// Netconn configuration builder
#[derive(Debug, Clone)]
pub struct NetconnConfig {
    /// Type used by [`Netstack::create_default`](crate::Netstack::create_default)
    pub conn_type: ConnType,
    /// Receive/accept timeout for new handles. `None` blocks forever.
    pub receive_timeout: Option<Duration>,
    /// Pending write bytes that trigger a send
    pub write_flush_threshold: usize,
    /// Buffers a connection may hold before the stack overflows it
    pub receive_queue_len: usize,
    /// Clients a listener may hold before they are accepted
    pub accept_queue_len: usize,
    /// Live connection handles across the whole stack
    pub max_connections: usize,
    /// Time the stack may spend establishing a connection
    pub connect_timeout: Duration,
    /// Close accepted clients after this long without traffic
    pub listen_idle_timeout: Option<Duration>,
    /// Default cap on concurrent clients per listener
    pub max_listen_conns: usize,
}

impl Default for NetconnConfig {
    fn default() -> Self {
        Self {
            conn_type: ConnType::Stream,
            receive_timeout: None,
            write_flush_threshold: 2048,
            receive_queue_len: 8,
            accept_queue_len: 5,
            max_connections: 16,
            connect_timeout: Duration::from_secs(10),
            listen_idle_timeout: None,
            max_listen_conns: 16,
        }
    }
}

impl NetconnConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conn_type(mut self, conn_type: ConnType) -> Self {
        self.conn_type = conn_type;
        self
    }

    /// Set the receive timeout. Zero means block forever.
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn write_flush_threshold(mut self, bytes: usize) -> Self {
        self.write_flush_threshold = bytes;
        self
    }

    pub fn receive_queue_len(mut self, len: usize) -> Self {
        self.receive_queue_len = len;
        self
    }

    pub fn accept_queue_len(mut self, len: usize) -> Self {
        self.accept_queue_len = len;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn listen_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.listen_idle_timeout = timeout;
        self
    }

    pub fn max_listen_conns(mut self, max: usize) -> Self {
        self.max_listen_conns = max;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.write_flush_threshold == 0 || self.write_flush_threshold > MAX_WRITE_CHUNK {
            return Err(NetconnError::config(format!(
                "write flush threshold must be between 1 and {MAX_WRITE_CHUNK}"
            )));
        }

        if self.receive_queue_len == 0 || self.accept_queue_len == 0 {
            return Err(NetconnError::config("Queue lengths must be greater than 0"));
        }

        if self.max_connections == 0 {
            return Err(NetconnError::config(
                "Max connections must be greater than 0",
            ));
        }

        if self.max_listen_conns == 0 {
            return Err(NetconnError::config(
                "Max listen connections must be greater than 0",
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(NetconnError::config("Connect timeout must be non-zero"));
        }

        Ok(())
    }
}

/// Preset configurations for common use cases
impl NetconnConfig {
    /// Small queues and few handles, sized like an embedded modem.
    pub fn constrained() -> Self {
        Self::default()
            .receive_queue_len(8)
            .accept_queue_len(5)
            .max_connections(5)
            .max_listen_conns(5)
            .write_flush_threshold(2048)
    }

    /// Deeper queues for a busy accept loop.
    pub fn server() -> Self {
        Self::default()
            .receive_queue_len(64)
            .accept_queue_len(32)
            .max_connections(256)
            .max_listen_conns(128)
            .write_flush_threshold(16 * 1024)
            .listen_idle_timeout(Some(Duration::from_secs(100)))
    }
}
