//! The observed-packet data model and the small keys derived from it.
//!
//! `Packet` is what the capture collaborator hands the dispatcher. Everything
//! else here — `Endpoint`, `TargetKey` — is a projection of a packet used to
//! key a dedup set somewhere downstream.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// IPv4 capture record, already parsed. Capture itself is out of scope; this
/// is the boundary type the reactor receives. `Serialize`/`Deserialize` are
/// derived not for any wire protocol of the reactor's own, but so a capture
/// adapter (e.g. the binary crate's JSONL file ingest, used in place of a
/// real capture library) can hand records across a process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
    pub ipid: u16,
    pub ttl: u8,
    /// Wall-clock seconds at observation time, used for hour-bucketing.
    pub observed_secs: u64,
    pub proto: Proto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp(TcpInfo),
    Udp(UdpInfo),
    Icmp(IcmpInfo),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpInfo {
    pub sport: u16,
    pub dport: u16,
    pub snum: u32,
    pub anum: u32,
    pub syn: bool,
    pub ack: bool,
    pub rst: bool,
    pub fin: bool,
    pub window_size: u16,
    #[serde(default)]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpInfo {
    pub sport: u16,
    pub dport: u16,
    #[serde(default)]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IcmpType {
    EchoReply,
    Other(u8),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcmpInfo {
    pub kind: IcmpType,
}

impl Packet {
    pub fn carries_tcp(&self) -> bool {
        matches!(self.proto, Proto::Tcp(_))
    }

    pub fn carries_udp(&self) -> bool {
        matches!(self.proto, Proto::Udp(_))
    }

    pub fn carries_icmp(&self) -> bool {
        matches!(self.proto, Proto::Icmp(_))
    }

    pub fn tcp(&self) -> Option<&TcpInfo> {
        match &self.proto {
            Proto::Tcp(t) => Some(t),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpInfo> {
        match &self.proto {
            Proto::Udp(u) => Some(u),
            _ => None,
        }
    }

    pub fn icmp(&self) -> Option<&IcmpInfo> {
        match &self.proto {
            Proto::Icmp(i) => Some(i),
            _ => None,
        }
    }

    /// Hour bucket this packet's observation falls into, `floor(t/3600)*3600`.
    pub fn hour_bucket(&self) -> u64 {
        align_to_hour(self.observed_secs)
    }
}

pub fn align_to_hour(t: u64) -> u64 {
    t - (t % 3600)
}

/// One end of a flow: used only to track in-flight delayed RSTs per
/// `(saddr, sport)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// De-dup key for the Prober Manager: at most one in-flight probe per
/// `(daddr, is_scanner_like)` pair. Protocol is deliberately absent — the
/// manager keeps separate sets per protocol instead, mirroring
/// `target_key.hpp`'s comment that protocol is "omitted because we use
/// separate sets to check."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub addr: Ipv4Addr,
    pub is_scanner_like: bool,
}

impl Packet {
    /// The key a shard would look a target up under, addressed at the sender
    /// of this packet (i.e. the future probe target).
    pub fn target_key(&self, is_scanner_like: bool) -> TargetKey {
        TargetKey {
            addr: self.saddr,
            is_scanner_like,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_bucket_floors_to_3600() {
        assert_eq!(align_to_hour(3600), 3600);
        assert_eq!(align_to_hour(3601), 3600);
        assert_eq!(align_to_hour(7199), 3600);
        assert_eq!(align_to_hour(7200), 7200);
    }

    #[test]
    fn proto_accessors_match_variant() {
        let p = Packet {
            saddr: Ipv4Addr::new(10, 0, 0, 1),
            daddr: Ipv4Addr::new(10, 255, 0, 5),
            ipid: 1,
            ttl: 64,
            observed_secs: 0,
            proto: Proto::Udp(UdpInfo {
                sport: 1,
                dport: 2,
                payload: vec![],
            }),
        };
        assert!(p.carries_udp());
        assert!(!p.carries_tcp());
        assert!(p.udp().is_some());
        assert!(p.tcp().is_none());
    }
}
