//! C5 — Dispatcher.
//!
//! Routes each observed packet to exactly one shard, deterministically and
//! statelessly, so that a given source address always lands on the same
//! shard (stable affinity keeps a flow's SYN and its follow-up ACK in the
//! same `rst_scheduled` set). Unlike the other components this one has no
//! thread or mailbox of its own — it's a pure function the capture-side
//! loop calls inline before handing a packet to a shard's channel.

use crate::metrics::DispatcherMetrics;
use crate::packet::Packet;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Deterministic shard index for `addr`, in `0..shard_count`. `shard_count`
/// must be nonzero; callers hold this as a config invariant
/// (`ReactorConfig::validate`).
pub fn shard_for_addr(addr: Ipv4Addr, shard_count: usize) -> usize {
    let octets = addr.octets();
    let addr_u32 = u32::from_be_bytes(octets);
    (addr_u32 as usize) % shard_count
}

/// Route a packet to a shard index, or `None` (and a counted drop) if
/// `shard_count` is zero — which should never happen past config
/// validation, but the dispatcher must never panic on bad input.
pub fn dispatch(pkt: &Packet, shard_count: usize, metrics: &Arc<DispatcherMetrics>) -> Option<usize> {
    if shard_count == 0 {
        metrics.dropped_no_shard.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return None;
    }
    Some(shard_for_addr(pkt.saddr, shard_count))
}
