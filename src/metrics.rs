//! Counters for connection lifecycle and traffic through the bridge

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Metrics collector owned by a [`Netstack`](crate::Netstack).
///
/// Updated from both the event context and consumer threads, so every
/// counter is a relaxed atomic.
#[derive(Debug, Default)]
pub struct Metrics {
    connections_created: AtomicU64,
    active_connections: AtomicUsize,
    accepted: AtomicU64,
    refused: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    overflow_resets: AtomicU64,
    discarded_buffers: AtomicU64,
}

impl Metrics {
    /// Record a new connection handle
    pub(crate) fn connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a handle leaving the registry
    pub(crate) fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn connection_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn overflow_reset(&self) {
        self.overflow_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn buffers_discarded(&self, n: usize) {
        self.discarded_buffers.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            overflow_resets: self.overflow_resets.load(Ordering::Relaxed),
            discarded_buffers: self.discarded_buffers.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_created: u64,
    pub active_connections: usize,
    pub accepted: u64,
    pub refused: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub overflow_resets: u64,
    pub discarded_buffers: u64,
}

impl MetricsSnapshot {
    /// Share of inbound clients that were refused
    pub fn refusal_rate(&self) -> f64 {
        let total = self.accepted + self.refused;
        if total == 0 {
            0.0
        } else {
            self.refused as f64 / total as f64
        }
    }

    /// Calculate total throughput in bytes per second
    pub fn throughput_bps(&self, duration: Duration) -> f64 {
        let secs = duration.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        (self.bytes_sent + self.bytes_received) as f64 / secs
    }
}

/// Format metrics for human-readable display
pub fn format_metrics(snapshot: &MetricsSnapshot) -> String {
    format!(
        "Netconn Metrics:\n\
         Connections: {} created, {} active\n\
         Accept: {} accepted, {} refused ({:.1}% refused)\n\
         Traffic: {} bytes sent, {} bytes received\n\
         Drops: {} overflow resets, {} discarded buffers",
        snapshot.connections_created,
        snapshot.active_connections,
        snapshot.accepted,
        snapshot.refused,
        snapshot.refusal_rate() * 100.0,
        snapshot.bytes_sent,
        snapshot.bytes_received,
        snapshot.overflow_resets,
        snapshot.discarded_buffers,
    )
}
