use std::sync::atomic::{AtomicU64, Ordering};
use crate::util::safe_converter::SafeCast;

/// Traffic counters of a peer, updated by the network thread
#[derive(Default)]
pub struct PeerStatistics {
    sent_bytes: AtomicU64,
    sent_packets: AtomicU64,
    received_bytes: AtomicU64,
    received_packets: AtomicU64,
    sent_messages: AtomicU64,
    received_messages: AtomicU64,
    resent_messages: AtomicU64,
    dropped_messages: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub sent_bytes: u64,
    pub sent_packets: u64,
    pub received_bytes: u64,
    pub received_packets: u64,
    /// user messages sent for the first time, counting each fragmented message once
    pub sent_messages: u64,
    /// user messages released to the application
    pub received_messages: u64,
    pub resent_messages: u64,
    /// reliable messages that were dropped after exhausting their resends
    pub dropped_messages: u64,
}

impl PeerStatistics {
    pub(crate) fn on_packet_sent(&self, num_bytes: usize) {
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(num_bytes.safe_cast(), Ordering::Relaxed);
    }

    pub(crate) fn on_packet_received(&self, num_bytes: usize) {
        self.received_packets.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(num_bytes.safe_cast(), Ordering::Relaxed);
    }

    pub(crate) fn add_sent_messages(&self, n: usize) {
        self.sent_messages.fetch_add(n.safe_cast(), Ordering::Relaxed);
    }

    pub(crate) fn add_received_messages(&self, n: usize) {
        self.received_messages.fetch_add(n.safe_cast(), Ordering::Relaxed);
    }

    pub(crate) fn add_resent_messages(&self, n: usize) {
        self.resent_messages.fetch_add(n.safe_cast(), Ordering::Relaxed);
    }

    pub(crate) fn add_dropped_messages(&self, n: usize) {
        self.dropped_messages.fetch_add(n.safe_cast(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            received_packets: self.received_packets.load(Ordering::Relaxed),
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            received_messages: self.received_messages.load(Ordering::Relaxed),
            resent_messages: self.resent_messages.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
        }
    }
}
