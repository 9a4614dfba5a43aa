//! Error types for the netconn core primitives

use std::fmt;

/// Errors produced by [`Pbuf`](crate::pbuf::Pbuf) operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PbufError {
    /// The same buffer handle was released twice.
    DoubleRelease,
    /// Operation on a handle that was already released.
    Released,
    /// Appending would make the chain loop back onto itself.
    SelfChain,
}

impl PbufError {
    /// Misuse errors indicate a bug in the caller rather than a runtime condition.
    pub fn is_misuse(&self) -> bool {
        matches!(self, PbufError::DoubleRelease | PbufError::Released)
    }
}

impl fmt::Display for PbufError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PbufError::DoubleRelease => write!(f, "buffer released twice"),
            PbufError::Released => write!(f, "buffer already released"),
            PbufError::SelfChain => write!(f, "buffer cannot be chained onto itself"),
        }
    }
}

impl std::error::Error for PbufError {}

/// A non-blocking push was refused. The rejected message is handed back so
/// the caller decides what happens to the buffer it carries.
#[derive(Debug)]
pub enum PushError<T> {
    /// Queue capacity reached
    Full(T),
    /// A terminal message is already latched on the queue
    Closed(T),
}

impl<T> PushError<T> {
    /// Recover the rejected message.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(msg) | PushError::Closed(msg) => msg,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, PushError::Full(_))
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => write!(f, "queue is full"),
            PushError::Closed(_) => write!(f, "queue is closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for PushError<T> {}

/// A blocking pop gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// No message arrived before the timeout elapsed
    Timeout,
}

impl fmt::Display for PopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopError::Timeout => write!(f, "timed out waiting for a message"),
        }
    }
}

impl std::error::Error for PopError {}
