//! CSV row encoding for the two header families in §6: raw observed-packet
//! events (with an optional probe reaction) and decoded Scamper replies.
//! Pipe-separated, lowercase hex, missing fields left empty.

use crate::codec::to_hex_string;
use crate::packet::{Packet, Proto};
use crate::request::{ProbeMethod, ProbeRequest};
use crate::codec::PingReply;

pub const EVENTS_HEADER: &str = "ts|saddr|daddr|ipid|ttl|proto|sport|dport|anum|snum|options|payload|syn|ack|rst|fin|window_size|probed|method|userid|probe_anum|probe_snum|num_probes";

pub const REPLIES_HEADER: &str = "start_sec|start_usec|method|userid|ping_sent|src|dst|sport|dport";

fn method_name(m: ProbeMethod) -> &'static str {
    m.scamper_name()
}

/// One row per observed packet. `req` is `Some` when a probe was reacted
/// with, `None` for a log-only path.
pub fn format_event_row(pkt: &Packet, req: Option<&ProbeRequest>) -> String {
    let (proto, sport, dport, anum, snum, options, payload, syn, ack, rst, fin, window_size) =
        match &pkt.proto {
            Proto::Tcp(t) => (
                "tcp",
                t.sport.to_string(),
                t.dport.to_string(),
                t.anum.to_string(),
                t.snum.to_string(),
                String::new(),
                to_hex_string(&t.payload),
                t.syn.to_string(),
                t.ack.to_string(),
                t.rst.to_string(),
                t.fin.to_string(),
                t.window_size.to_string(),
            ),
            Proto::Udp(u) => (
                "udp",
                u.sport.to_string(),
                u.dport.to_string(),
                String::new(),
                String::new(),
                String::new(),
                to_hex_string(&u.payload),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
            ),
            Proto::Icmp(_) => (
                "icmp",
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
            ),
        };

    let (probed, method, userid, probe_anum, probe_snum, num_probes) = match req {
        Some(r) => (
            "true".to_string(),
            method_name(r.method).to_string(),
            r.user_id.to_string(),
            r.anum.to_string(),
            r.snum.to_string(),
            r.num_probes.to_string(),
        ),
        None => (
            "false".to_string(),
            String::new(),
            String::new(),
            String::new(),
            String::new(),
            String::new(),
        ),
    };

    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        pkt.observed_secs,
        pkt.saddr,
        pkt.daddr,
        pkt.ipid,
        pkt.ttl,
        proto,
        sport,
        dport,
        anum,
        snum,
        options,
        payload,
        syn,
        ack,
        rst,
        fin,
        window_size,
        probed,
        method,
        userid,
        probe_anum,
        probe_snum,
        num_probes,
    )
}

pub fn format_reply_row(reply: &PingReply) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}",
        reply.start_sec,
        reply.start_usec,
        method_name(reply.method),
        reply.user_id,
        reply.ping_sent,
        reply.src,
        reply.dst,
        reply.sport,
        reply.dport,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{TcpInfo};
    use std::net::Ipv4Addr;

    #[test]
    fn log_only_row_has_empty_probe_fields() {
        let pkt = Packet {
            saddr: Ipv4Addr::new(10, 0, 0, 1),
            daddr: Ipv4Addr::new(10, 255, 0, 5),
            ipid: 1,
            ttl: 64,
            observed_secs: 1000,
            proto: Proto::Tcp(TcpInfo {
                sport: 40000,
                dport: 80,
                snum: 100,
                anum: 0,
                syn: false,
                ack: false,
                rst: false,
                fin: true,
                window_size: 0,
                payload: vec![],
            }),
        };
        let row = format_event_row(&pkt, None);
        assert!(row.ends_with("||||||"));
        assert!(row.contains("|false|||||"));
    }

    #[test]
    fn probed_row_includes_method_and_userid() {
        let pkt = Packet {
            saddr: Ipv4Addr::new(10, 0, 0, 1),
            daddr: Ipv4Addr::new(10, 255, 0, 5),
            ipid: 1,
            ttl: 64,
            observed_secs: 1000,
            proto: Proto::Tcp(TcpInfo {
                sport: 40000,
                dport: 80,
                snum: 100,
                anum: 0,
                syn: true,
                ack: false,
                rst: false,
                fin: false,
                window_size: 0,
                payload: vec![],
            }),
        };
        let req = ProbeRequest {
            method: ProbeMethod::TcpSynAck,
            saddr: pkt.daddr,
            daddr: pkt.saddr,
            sport: 80,
            dport: 40000,
            snum: 0,
            anum: 101,
            user_id: 7,
            payload: vec![],
            num_probes: 1,
        };
        let row = format_event_row(&pkt, Some(&req));
        assert!(row.contains("|true|tcp-synack|7|101|0|1"));
    }
}
