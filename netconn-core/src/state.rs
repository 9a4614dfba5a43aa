//! Connection lifecycle state shared by the event context and consumers

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a connection handle.
///
/// ```text
///  Idle ──► Connecting ──► Connected ──► Closing ──► Closed
///              │               │                      ▲
///              └───────────────┴──────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Idle,
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            3 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Closed)
                | (Connecting, Connected)
                | (Connecting, Closed)
                | (Connected, Closing)
                | (Connected, Closed)
                | (Closing, Closed)
        )
    }

    /// Destruction is only valid from these states.
    pub fn is_destroyable(self) -> bool {
        matches!(self, ConnState::Idle | ConnState::Closed)
    }

    pub fn is_open(self) -> bool {
        matches!(self, ConnState::Connecting | ConnState::Connected)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Idle => "idle",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Closing => "closing",
            ConnState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Atomically updated [`ConnState`].
///
/// Every update is a compare-and-set, so the event context can move a
/// connection forward without ever waiting on a consumer thread.
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
}

impl StateCell {
    pub fn new(state: ConnState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
        }
    }

    pub fn get(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from exactly `from` to `to`. On failure returns the state found.
    pub fn transition(&self, from: ConnState, to: ConnState) -> Result<(), ConnState> {
        if !from.can_transition_to(to) {
            return Err(self.get());
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnState::from_u8)
    }

    /// Move to `to` from whatever state permits it. Returns the previous
    /// state, or the current one if the lifecycle forbids the move.
    pub fn advance(&self, to: ConnState) -> Result<ConnState, ConnState> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                ConnState::from_u8(cur)
                    .can_transition_to(to)
                    .then_some(to as u8)
            })
            .map(ConnState::from_u8)
            .map_err(ConnState::from_u8)
    }

    /// Jump straight to `Closed` from any state. Returns the previous state.
    pub fn force_closed(&self) -> ConnState {
        ConnState::from_u8(self.state.swap(ConnState::Closed as u8, Ordering::AcqRel))
    }
}
