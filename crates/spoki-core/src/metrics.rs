//! Ambient metrics: lock-free atomic counters per component, with a
//! point-in-time `snapshot()` giving a plain (non-atomic) struct — the same
//! shape the teacher crate uses for its per-source counters.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds now. Every timestamp the reactor stamps onto packets
/// and log rows comes from here.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    pub dropped_no_shard: AtomicU64,
}

impl DispatcherMetrics {
    pub fn snapshot(&self) -> DispatcherSnapshot {
        DispatcherSnapshot {
            dropped_no_shard: self.dropped_no_shard.load(Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatcherSnapshot {
    pub dropped_no_shard: u64,
}

#[derive(Debug, Default)]
pub struct ShardMetrics {
    pub packets_seen: AtomicU64,
    pub tcp_synack_sent: AtomicU64,
    pub tcp_rst_scheduled: AtomicU64,
    pub tcp_rst_dropped_duplicate: AtomicU64,
    pub udp_probes_sent: AtomicU64,
    pub icmp_probes_sent: AtomicU64,
}

impl ShardMetrics {
    pub fn snapshot(&self) -> ShardSnapshot {
        ShardSnapshot {
            packets_seen: self.packets_seen.load(Relaxed),
            tcp_synack_sent: self.tcp_synack_sent.load(Relaxed),
            tcp_rst_scheduled: self.tcp_rst_scheduled.load(Relaxed),
            tcp_rst_dropped_duplicate: self.tcp_rst_dropped_duplicate.load(Relaxed),
            udp_probes_sent: self.udp_probes_sent.load(Relaxed),
            icmp_probes_sent: self.icmp_probes_sent.load(Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShardSnapshot {
    pub packets_seen: u64,
    pub tcp_synack_sent: u64,
    pub tcp_rst_scheduled: u64,
    pub tcp_rst_dropped_duplicate: u64,
    pub udp_probes_sent: u64,
    pub icmp_probes_sent: u64,
}

/// Per-driver rate-accounting state the Prober Manager surfaces once a
/// second (§4.3's accounting tick).
#[derive(Debug, Default)]
pub struct ManagerMetrics {
    pub requests_accepted: AtomicU64,
    pub replies_returned: AtomicU64,
    pub dropped_duplicate_target: AtomicU64,
    pub stray_replies: AtomicU64,
}

impl ManagerMetrics {
    pub fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            requests_accepted: self.requests_accepted.load(Relaxed),
            replies_returned: self.replies_returned.load(Relaxed),
            dropped_duplicate_target: self.dropped_duplicate_target.load(Relaxed),
            stray_replies: self.stray_replies.load(Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerSnapshot {
    pub requests_accepted: u64,
    pub replies_returned: u64,
    pub dropped_duplicate_target: u64,
    pub stray_replies: u64,
}

#[derive(Debug, Default)]
pub struct DriverMetrics {
    /// Credit granted by the daemon's MORE protocol. Signed so a logic bug
    /// that drives it negative is visible in a snapshot instead of wrapping.
    pub credit: AtomicI64,
    pub commands_written: AtomicU64,
    pub protocol_violations: AtomicU64,
    pub decode_failures: AtomicU64,
    pub queue_depth: AtomicUsize,
}

impl DriverMetrics {
    pub fn snapshot(&self) -> DriverSnapshot {
        DriverSnapshot {
            credit: self.credit.load(Relaxed),
            commands_written: self.commands_written.load(Relaxed),
            protocol_violations: self.protocol_violations.load(Relaxed),
            decode_failures: self.decode_failures.load(Relaxed),
            queue_depth: self.queue_depth.load(Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DriverSnapshot {
    pub credit: i64,
    pub commands_written: u64,
    pub protocol_violations: u64,
    pub decode_failures: u64,
    pub queue_depth: usize,
}

#[derive(Debug, Default)]
pub struct LogWriterMetrics {
    pub records_written: AtomicU64,
    pub misbucketed_dropped: AtomicU64,
}

impl LogWriterMetrics {
    pub fn snapshot(&self) -> LogWriterSnapshot {
        LogWriterSnapshot {
            records_written: self.records_written.load(Relaxed),
            misbucketed_dropped: self.misbucketed_dropped.load(Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogWriterSnapshot {
    pub records_written: u64,
    pub misbucketed_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let m = ManagerMetrics::default();
        m.requests_accepted.fetch_add(3, Relaxed);
        m.stray_replies.fetch_add(1, Relaxed);
        let snap = m.snapshot();
        assert_eq!(snap.requests_accepted, 3);
        assert_eq!(snap.stray_replies, 1);
    }
}
