//! Error types for netconn.
//!
//! [`NetconnError`] extends the core buffer and queue errors with connection,
//! timeout, state, and stack variants needed by the blocking facade.

use netconn_core::{ConnState, PbufError, Terminal};
use std::fmt;
use thiserror::Error;

/// Result type for netconn operations
pub type Result<T> = std::result::Result<T, NetconnError>;

// ── Error types ─────────────────────────────────────────────────────────

/// Errors returned by the blocking connection API
#[derive(Error, Debug)]
pub enum NetconnError {
    /// I/O errors from the underlying sockets
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection ended, was refused, or never came up
    #[error("Connection error: {kind}")]
    Connection { kind: ConnectionError },

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Operation not allowed in the current lifecycle state
    #[error("Cannot {op} while connection is {state}")]
    InvalidState { op: &'static str, state: ConnState },

    /// Another handle already owns the port
    #[error("Port {port} is already bound")]
    PortInUse { port: u16 },

    /// Connection table or listener slots used up
    #[error("Resources exhausted: {message}")]
    Exhausted { message: String },

    /// Buffer ownership misuse
    #[error("Buffer error: {0}")]
    Buffer(#[from] PbufError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The network stack failed or stopped
    #[error("Stack error: {message}")]
    Stack { message: String },
}

/// Specific connection error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    /// Connection closed, locally or by the peer
    Closed,
    /// Connection reset
    Reset,
    /// Connection refused
    Refused,
    /// Not connected yet
    NotConnected,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Reset => write!(f, "connection reset by peer"),
            Self::Refused => write!(f, "connection refused"),
            Self::NotConnected => write!(f, "not connected"),
        }
    }
}

impl From<Terminal> for ConnectionError {
    fn from(t: Terminal) -> Self {
        match t {
            Terminal::Closed => Self::Closed,
            Terminal::Reset => Self::Reset,
        }
    }
}

/// Coarse outcome of a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    /// Graceful end of stream. Not a failure.
    Closed = 1,
    /// Abrupt termination, distinguishable from `Closed`.
    Reset = 2,
    /// A configured timeout elapsed with nothing to report.
    Timeout = 3,
    /// Resource exhaustion, invalid state, or misuse.
    Err = 4,
}

impl Status {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Ok,
            1 => Status::Closed,
            2 => Status::Reset,
            3 => Status::Timeout,
            _ => Status::Err,
        }
    }
}

// ── Constructors ────────────────────────────────────────────────────────

impl NetconnError {
    pub fn connection(kind: ConnectionError) -> Self {
        Self::Connection { kind }
    }

    pub fn closed() -> Self {
        Self::Connection {
            kind: ConnectionError::Closed,
        }
    }

    pub fn reset() -> Self {
        Self::Connection {
            kind: ConnectionError::Reset,
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn invalid_state(op: &'static str, state: ConnState) -> Self {
        Self::InvalidState { op, state }
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::Exhausted {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn stack(message: impl Into<String>) -> Self {
        Self::Stack {
            message: message.into(),
        }
    }
}

// ── Predicates ──────────────────────────────────────────────────────────

impl NetconnError {
    /// Map onto the OK/CLOSED/RESET/TIMEOUT/ERR taxonomy.
    pub fn status(&self) -> Status {
        match self {
            Self::Connection {
                kind: ConnectionError::Closed,
            } => Status::Closed,
            Self::Connection {
                kind: ConnectionError::Reset,
            } => Status::Reset,
            Self::Timeout { .. } => Status::Timeout,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => Status::Timeout,
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                    Status::Reset
                }
                _ => Status::Err,
            },
            _ => Status::Err,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status() == Status::Closed
    }

    pub fn is_reset(&self) -> bool {
        self.status() == Status::Reset
    }

    pub fn is_timeout(&self) -> bool {
        self.status() == Status::Timeout
    }

    /// Whether retrying the same call may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            Self::Timeout { .. } | Self::Exhausted { .. } => true,
            _ => false,
        }
    }

    /// Programming errors: calling an operation in the wrong state or
    /// mishandling a buffer.
    pub fn is_misuse(&self) -> bool {
        match self {
            Self::InvalidState { .. } => true,
            Self::Buffer(e) => e.is_misuse(),
            _ => false,
        }
    }
}
