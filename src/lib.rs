//! # netconn - Blocking Connections over an Event-Driven Stack
//!
//! A sequential connection API (connect, accept, receive, write, close) for
//! ordinary threads, layered on a network stack that reports its events from
//! a context that must never block.
//!
//! ## Features
//!
//! - **Never-blocking event side**: the [`EventBridge`] only pushes onto
//!   bounded queues and flips atomic state
//! - **Ordered delivery**: per-connection FIFO of received buffers, followed
//!   by exactly one end-of-stream signal that repeats forever
//! - **Explicit buffer ownership**: received [`Pbuf`]s are released exactly
//!   once; double release is reported
//! - **Pluggable stack**: implement [`Stack`], or use the tokio-backed
//!   [`TokioStack`]
//! - **Observability**: integrated tracing and metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use netconn::{ConnType, NetconnConfig, Netstack};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = tokio::runtime::Runtime::new()?;
//!     let netstack = Netstack::tokio(NetconnConfig::default(), runtime.handle())?;
//!
//!     let conn = netstack.create(ConnType::Stream)?;
//!     conn.connect("example.com", 80)?;
//!     conn.write(b"GET / HTTP/1.0\r\n\r\n")?;
//!     conn.flush()?;
//!
//!     while let Some(pbuf) = conn.receive()? {
//!         println!("{} bytes", pbuf.len());
//!         pbuf.release()?;
//!     }
//!     conn.close()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │   Blocking API      │  Netstack, Netconn (consumer threads)
//! ├─────────────────────┤
//! │   Bridge Layer      │  EventBridge, connection registry
//! ├─────────────────────┤
//! │   Core Primitives   │  MessageQueue, Pbuf, StateCell (netconn-core)
//! ├─────────────────────┤
//! │   Stack             │  Stack trait, TokioStack (event context)
//! └─────────────────────┘
//! ```

mod bridge;
pub mod config;
pub mod error;
mod listener;
pub mod metrics;
mod netconn;
mod netstack;
mod registry;
pub mod stack;

#[cfg(feature = "runtime-tokio")]
mod actor;
#[cfg(feature = "runtime-tokio")]
mod tokio_stack;

// Re-exports
pub use bridge::{Delivery, EventBridge};
pub use config::{ConnType, NetconnConfig};
pub use error::{ConnectionError, NetconnError, Result, Status};
pub use metrics::{format_metrics, Metrics, MetricsSnapshot};
pub use netconn::Netconn;
pub use netconn_core::{ConnState, Pbuf, PbufError};
pub use netstack::Netstack;
pub use registry::ConnId;
pub use stack::{Reply, Stack, StackRequest};
#[cfg(feature = "runtime-tokio")]
pub use tokio_stack::TokioStack;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
