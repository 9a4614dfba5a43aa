//! Ordered conduit between the event context and a blocking consumer.
//!
//! Data travels through a bounded channel; the end-of-stream signal does
//! not. A terminal is a latch next to the channel, so it can always be set
//! without space in the channel and without blocking the producer. Parked
//! consumers are woken through a single-slot wake channel.

use crate::error::{PopError, PushError};
use crate::message::{QueueMessage, Terminal};

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError, TrySendError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

const OPEN: u8 = 0;
const LATCHED_CLOSED: u8 = 1;
const LATCHED_RESET: u8 = 2;

/// Bounded FIFO with a non-blocking push and a blocking pop.
///
/// `push` never blocks and fails fast when the queue is full. `pop` parks the
/// calling thread until data, a terminal, or the timeout. Once a consumer has
/// observed the terminal, every later `pop` returns the same terminal
/// immediately.
pub struct MessageQueue<T> {
    data_tx: Sender<T>,
    data_rx: Receiver<T>,
    latch: AtomicU8,
    observed: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    capacity: usize,
}

impl<T> MessageQueue<T> {
    /// Create a queue holding at most `capacity` data messages.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (data_tx, data_rx) = bounded(capacity);
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            data_tx,
            data_rx,
            latch: AtomicU8::new(OPEN),
            observed: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            capacity,
        }
    }

    /// Push any message. Terminal messages always succeed.
    pub fn push(&self, msg: QueueMessage<T>) -> Result<(), PushError<QueueMessage<T>>> {
        match msg {
            QueueMessage::Data(item) => self.push_data(item).map_err(|e| match e {
                PushError::Full(item) => PushError::Full(QueueMessage::Data(item)),
                PushError::Closed(item) => PushError::Closed(QueueMessage::Data(item)),
            }),
            QueueMessage::Closed => {
                self.latch(Terminal::Closed);
                Ok(())
            }
            QueueMessage::Reset => {
                self.latch(Terminal::Reset);
                Ok(())
            }
        }
    }

    /// Push a data message without blocking.
    pub fn push_data(&self, item: T) -> Result<(), PushError<T>> {
        if self.latch.load(Ordering::Acquire) != OPEN {
            return Err(PushError::Closed(item));
        }
        match self.data_tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => Err(PushError::Full(item)),
            Err(TrySendError::Disconnected(item)) => Err(PushError::Closed(item)),
        }
    }

    /// Latch `Closed` and wake any parked consumer.
    pub fn close(&self) -> bool {
        self.latch(Terminal::Closed)
    }

    /// Latch `Reset` and wake any parked consumer.
    pub fn reset(&self) -> bool {
        self.latch(Terminal::Reset)
    }

    /// Set the terminal latch. The first terminal wins; returns whether this
    /// call was the one that latched.
    pub fn latch(&self, terminal: Terminal) -> bool {
        let value = match terminal {
            Terminal::Closed => LATCHED_CLOSED,
            Terminal::Reset => LATCHED_RESET,
        };
        let latched = self
            .latch
            .compare_exchange(OPEN, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if latched {
            trace!(?terminal, "Queue latched");
        }
        let _ = self.wake_tx.try_send(());
        latched
    }

    /// The latched terminal, if any. Queued data may still precede it.
    pub fn terminal(&self) -> Option<Terminal> {
        match self.latch.load(Ordering::Acquire) {
            LATCHED_CLOSED => Some(Terminal::Closed),
            LATCHED_RESET => Some(Terminal::Reset),
            _ => None,
        }
    }

    /// Whether a consumer has already been handed the terminal.
    pub fn is_finished(&self) -> bool {
        self.observed.load(Ordering::Acquire)
    }

    /// Block until a message is available or `timeout` elapses.
    /// `None` waits forever.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<QueueMessage<T>, PopError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(msg) = self.try_pop() {
                return Ok(msg);
            }

            let received = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    select! {
                        recv(self.data_rx) -> item => item.ok(),
                        recv(self.wake_rx) -> _ => None,
                        default(remaining) => return Err(PopError::Timeout),
                    }
                }
                None => select! {
                    recv(self.data_rx) -> item => item.ok(),
                    recv(self.wake_rx) -> _ => None,
                },
            };

            if let Some(item) = received {
                return Ok(QueueMessage::Data(item));
            }
        }
    }

    /// Non-blocking pop. `None` means nothing is available yet.
    pub fn try_pop(&self) -> Option<QueueMessage<T>> {
        if let Some(terminal) = self.finished_terminal() {
            return Some(terminal.into());
        }

        match self.data_rx.try_recv() {
            Ok(item) => return Some(QueueMessage::Data(item)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }

        let terminal = self.terminal()?;
        // Pushes that completed before the latch are visible once it is.
        if let Ok(item) = self.data_rx.try_recv() {
            return Some(QueueMessage::Data(item));
        }
        self.observed.store(true, Ordering::Release);
        // Pass the wakeup on to any other parked consumer.
        let _ = self.wake_tx.try_send(());
        Some(terminal.into())
    }

    fn finished_terminal(&self) -> Option<Terminal> {
        if self.observed.load(Ordering::Acquire) {
            self.terminal()
        } else {
            None
        }
    }

    /// Remove everything still queued.
    pub fn drain(&self) -> Vec<T> {
        self.data_rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.data_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> fmt::Debug for MessageQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("terminal", &self.terminal())
            .field("finished", &self.is_finished())
            .finish()
    }
}
