//! Units of transport between the event context and consumer threads

/// End-of-stream signal for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Graceful close, local or remote
    Closed,
    /// Abrupt termination (peer reset, overflow, stack error)
    Reset,
}

/// A message carried by a [`MessageQueue`](crate::queue::MessageQueue).
#[derive(Debug, PartialEq, Eq)]
pub enum QueueMessage<T> {
    Data(T),
    Closed,
    Reset,
}

impl<T> QueueMessage<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueMessage::Data(_))
    }

    pub fn terminal(&self) -> Option<Terminal> {
        match self {
            QueueMessage::Data(_) => None,
            QueueMessage::Closed => Some(Terminal::Closed),
            QueueMessage::Reset => Some(Terminal::Reset),
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            QueueMessage::Data(item) => Some(item),
            _ => None,
        }
    }
}

impl<T> From<Terminal> for QueueMessage<T> {
    fn from(terminal: Terminal) -> Self {
        match terminal {
            Terminal::Closed => QueueMessage::Closed,
            Terminal::Reset => QueueMessage::Reset,
        }
    }
}
