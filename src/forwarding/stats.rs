//! Forwarding counters

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use super::pipe::Direction;

/// Snapshot of one tunnel's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Connections open right now
    pub active_connections: u64,
    /// Bytes sent (local -> remote)
    pub bytes_sent: u64,
    /// Bytes received (remote -> local)
    pub bytes_received: u64,
}

/// Live counters for one tunnel
#[derive(Debug, Default)]
pub struct TunnelStats {
    connection_count: AtomicU64,
    active_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TunnelStats {
    /// Count a new connection, returns the number now active
    pub fn connected(&self) -> u64 {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        self.active_connections.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Count a finished connection, returns the number still active
    pub fn disconnected(&self) -> u64 {
        let prev = self
            .active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn record(&self, direction: Direction, bytes: usize) {
        let counter = match direction {
            Direction::Transmit => &self.bytes_sent,
            Direction::Receive => &self.bytes_received,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::SeqCst),
            active_connections: self.active_connections.load(Ordering::SeqCst),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Counters shared by every tunnel in the daemon
#[derive(Debug, Default)]
pub struct ProcessStats {
    next_connection_id: AtomicU64,
    copies_in_flight: AtomicI64,
}

impl ProcessStats {
    /// Allocate a connection id (starting at 1)
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Copy directions currently running
    pub fn copies_in_flight(&self) -> i64 {
        self.copies_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn copy_started(&self) -> i64 {
        self.copies_in_flight.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn copy_finished(&self) -> i64 {
        self.copies_in_flight.fetch_sub(1, Ordering::SeqCst) - 1
    }
}
