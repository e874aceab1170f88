//! Engine Statistics
//!
//! Lock-free counters updated from the packet loop and every downlink task.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Engine-wide counters
#[derive(Debug, Default)]
pub struct EngineStats {
    pub packets_read: AtomicU64,
    pub bytes_read: AtomicU64,
    pub packets_injected: AtomicU64,
    pub bytes_injected: AtomicU64,
    pub uplink_packets: AtomicU64,
    pub uplink_bytes: AtomicU64,
    pub flows_created: AtomicU64,
    pub flows_expired: AtomicU64,
    pub untracked_packets: AtomicU64,
    pub blocked_packets: AtomicU64,
    pub pending_packets: AtomicU64,
    pub unforwardable_packets: AtomicU64,
    pub forwarders_created: AtomicU64,
    pub forwarders_closed: AtomicU64,
    pub parse_failures: AtomicU64,
    pub attribution_misses: AtomicU64,
    pub socket_setup_failures: AtomicU64,
    pub socket_io_failures: AtomicU64,
    pub capacity_rejections: AtomicU64,
    pub cleanup_failures: AtomicU64,
    pub evaluation_failures: AtomicU64,
}

impl EngineStats {
    #[inline(always)]
    pub fn record_read(&self, bytes: usize) {
        self.packets_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_injected(&self, bytes: usize) {
        self.packets_injected.fetch_add(1, Ordering::Relaxed);
        self.bytes_injected.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_uplink(&self, bytes: usize) {
        self.uplink_packets.fetch_add(1, Ordering::Relaxed);
        self.uplink_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one occurrence of a failure class
    #[inline]
    pub fn record_error(&self, kind: ErrorKind) {
        let counter = match kind {
            ErrorKind::ParseFailure => &self.parse_failures,
            ErrorKind::AttributionMiss => &self.attribution_misses,
            ErrorKind::SocketSetupFailure => &self.socket_setup_failures,
            ErrorKind::SocketIoFailure => &self.socket_io_failures,
            ErrorKind::CapacityExceeded => &self.capacity_rejections,
            ErrorKind::CleanupFailure => &self.cleanup_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_read: load(&self.packets_read),
            bytes_read: load(&self.bytes_read),
            packets_injected: load(&self.packets_injected),
            bytes_injected: load(&self.bytes_injected),
            uplink_packets: load(&self.uplink_packets),
            uplink_bytes: load(&self.uplink_bytes),
            flows_created: load(&self.flows_created),
            flows_expired: load(&self.flows_expired),
            untracked_packets: load(&self.untracked_packets),
            blocked_packets: load(&self.blocked_packets),
            pending_packets: load(&self.pending_packets),
            unforwardable_packets: load(&self.unforwardable_packets),
            forwarders_created: load(&self.forwarders_created),
            forwarders_closed: load(&self.forwarders_closed),
            parse_failures: load(&self.parse_failures),
            attribution_misses: load(&self.attribution_misses),
            socket_setup_failures: load(&self.socket_setup_failures),
            socket_io_failures: load(&self.socket_io_failures),
            capacity_rejections: load(&self.capacity_rejections),
            cleanup_failures: load(&self.cleanup_failures),
            evaluation_failures: load(&self.evaluation_failures),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub packets_read: u64,
    pub bytes_read: u64,
    pub packets_injected: u64,
    pub bytes_injected: u64,
    pub uplink_packets: u64,
    pub uplink_bytes: u64,
    pub flows_created: u64,
    pub flows_expired: u64,
    pub untracked_packets: u64,
    pub blocked_packets: u64,
    pub pending_packets: u64,
    pub unforwardable_packets: u64,
    pub forwarders_created: u64,
    pub forwarders_closed: u64,
    pub parse_failures: u64,
    pub attribution_misses: u64,
    pub socket_setup_failures: u64,
    pub socket_io_failures: u64,
    pub capacity_rejections: u64,
    pub cleanup_failures: u64,
    pub evaluation_failures: u64,
}

impl StatsSnapshot {
    /// Total failures across every class
    pub fn total_errors(&self) -> u64 {
        self.parse_failures
            + self.attribution_misses
            + self.socket_setup_failures
            + self.socket_io_failures
            + self.capacity_rejections
            + self.cleanup_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_stats() {
        let stats = EngineStats::default();
        stats.record_read(1500);
        stats.record_injected(90);
        stats.record_error(ErrorKind::ParseFailure);
        stats.record_error(ErrorKind::CapacityExceeded);
        EngineStats::incr(&stats.flows_created);

        let snap = stats.snapshot();
        assert_eq!(snap.packets_read, 1);
        assert_eq!(snap.bytes_read, 1500);
        assert_eq!(snap.bytes_injected, 90);
        assert_eq!(snap.parse_failures, 1);
        assert_eq!(snap.capacity_rejections, 1);
        assert_eq!(snap.flows_created, 1);
        assert_eq!(snap.total_errors(), 2);
    }
}
