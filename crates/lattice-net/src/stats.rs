//! Per-session traffic counters.
//!
//! Network tasks bump the counters lock-free; owners periodically take a
//! [`StatsSnapshot`] to report bandwidth per measurement period.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters incremented by the network tasks.
#[derive(Debug, Default)]
pub struct NetworkCounters {
    /// Wire bytes sent (framed, post-pipeline).
    pub bytes_sent: AtomicU64,
    /// Wire bytes received.
    pub bytes_received: AtomicU64,
    /// Messages handed to the transport.
    pub messages_sent: AtomicU64,
    /// Messages decoded from the transport.
    pub messages_received: AtomicU64,
}

impl NetworkCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one outgoing message of `wire_bytes`.
    pub fn record_send(&self, wire_bytes: u64) {
        self.bytes_sent.fetch_add(wire_bytes, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record raw bytes read from the transport.
    pub fn record_bytes_received(&self, wire_bytes: u64) {
        self.bytes_received.fetch_add(wire_bytes, Ordering::Relaxed);
    }

    /// Record one decoded message.
    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the counters without resetting them.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }

    /// Snapshot and reset all counters (swap with 0).
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
            bytes_received: self.bytes_received.swap(0, Ordering::Relaxed),
            messages_sent: self.messages_sent.swap(0, Ordering::Relaxed),
            messages_received: self.messages_received.swap(0, Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`NetworkCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Wire bytes sent.
    pub bytes_sent: u64,
    /// Wire bytes received.
    pub bytes_received: u64,
    /// Messages sent.
    pub messages_sent: u64,
    /// Messages received.
    pub messages_received: u64,
}

impl StatsSnapshot {
    /// Total bytes in both directions.
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}
