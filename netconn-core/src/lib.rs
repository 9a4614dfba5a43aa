//! Runtime-free building blocks for the netconn blocking API.
//!
//! Nothing in this crate spawns tasks or performs I/O. It only provides the
//! pieces shared between a stack's event context and blocking consumer
//! threads.
//!
//! ```text
//! ┌────────────────────────────────┐
//! │  netconn-core                  │
//! │                                │
//! │  pbuf     ← refcounted chains  │
//! │  message  ← Data/Closed/Reset  │
//! │  queue    ← push / pop / latch │
//! │  state    ← lifecycle cell     │
//! │  error    ← core errors        │
//! └────────────────────────────────┘
//! ```

pub mod error;
pub mod message;
pub mod pbuf;
pub mod queue;
pub mod state;

pub use error::{PbufError, PopError, PushError};
pub use message::{QueueMessage, Terminal};
pub use pbuf::{Chunks, Pbuf};
pub use queue::MessageQueue;
pub use state::{ConnState, StateCell};
