//! Connection statistics
//!
//! The membership service reports peer lifecycle and traffic volume through
//! [`ConnectionStatistics`]. [`AtomicConnectionStatistics`] is the built-in
//! lock-free implementation.

use crate::member::MemberIdentifier;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for connection lifecycle and traffic counters
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionStatistics: Send + Sync {
    /// A member entered the installed view
    fn member_connected(&self, member: &MemberIdentifier);

    /// A member left the installed view
    fn member_disconnected(&self, member: &MemberIdentifier);

    fn message_received(&self, bytes: usize);

    fn message_sent(&self, bytes: usize);
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Members currently connected
    pub connections: u64,
    pub connections_started: u64,
    pub connections_terminated: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Default)]
pub struct AtomicConnectionStatistics {
    connections: AtomicU64,
    connections_started: AtomicU64,
    connections_terminated: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl AtomicConnectionStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            connections_started: self.connections_started.load(Ordering::Relaxed),
            connections_terminated: self.connections_terminated.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl ConnectionStatistics for AtomicConnectionStatistics {
    fn member_connected(&self, _member: &MemberIdentifier) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.connections_started.fetch_add(1, Ordering::Relaxed);
    }

    fn member_disconnected(&self, _member: &MemberIdentifier) {
        // Saturate: a disconnect may be reported for a member seen before
        // the statistics were attached
        let _ = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| current.checked_sub(1));
        self.connections_terminated.fetch_add(1, Ordering::Relaxed);
    }

    fn message_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn message_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}
