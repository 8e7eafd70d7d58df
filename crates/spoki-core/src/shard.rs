//! C4 — Shard.
//!
//! Per-packet reactive state machine. One shard owns a deterministic slice
//! of source addresses (per the Dispatcher's routing) and decides, for each
//! arriving packet, whether to mint a probe request and which to build.
//! Grounded on `cache/shard.cpp`'s `handle_packet`, with the actor's
//! `delayed_send(self, ...)` recast as the shard re-delivering a message to
//! its own mailbox after a timer fires on a side thread.

use crate::csv_format::{format_event_row, EVENTS_HEADER};
use crate::log_writer::LogWriter;
use crate::manager::ManagerMsg;
use crate::metrics::{LogWriterMetrics, ShardMetrics};
use crate::packet::{Endpoint, Packet, Proto};
use crate::reply_buffer::ReplyBuffer;
use crate::request::{ProbeMethod, ProbeRequest};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashSet;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Duration;

const TAG_CNT_MAX: u32 = 0xffffff;

pub enum ShardMsg {
    Packet(Packet),
    /// A previously-scheduled RST request, delivered back to the shard's own
    /// mailbox once `reset_delay` has elapsed.
    DelayedRst(ProbeRequest),
    Shutdown,
}

/// Tunables a shard needs but that don't belong in the wire types
/// themselves — `spec.md` §4.2 calls these "configurable, default 1" (or,
/// for the reset delay, "a few tens of milliseconds").
#[derive(Debug, Clone, Copy)]
pub struct ShardTuning {
    pub enable_tcp: bool,
    pub enable_udp: bool,
    pub enable_icmp: bool,
    pub udp_reflect: bool,
    pub reset_delay: Duration,
    pub tcp_synack_probes: u16,
    pub tcp_rst_probes: u16,
    pub udp_probes: u16,
    pub icmp_probes: u16,
}

struct ShardState {
    shard_id: u32, // already shifted into the upper 8 bits
    tag_cnt: u32,
    rst_scheduled: HashSet<Endpoint>,
    tuning: ShardTuning,
    tcp_manager: Option<Sender<ManagerMsg>>,
    udp_manager: Option<Sender<ManagerMsg>>,
    icmp_manager: Option<Sender<ManagerMsg>>,
    self_tx: Sender<ShardMsg>,
    events: ReplyBuffer,
    metrics: Arc<ShardMetrics>,
}

impl ShardState {
    fn next_id(&mut self) -> u32 {
        self.tag_cnt = (self.tag_cnt + 1) & TAG_CNT_MAX;
        self.shard_id | self.tag_cnt
    }

    /// `is_scanner_like` derivation is explicitly out of scope (glossary);
    /// this reactor always treats sources as not scanner-like.
    fn is_scanner_like(&self, _pkt: &Packet) -> bool {
        false
    }

    fn log_event(&mut self, pkt: &Packet, req: Option<&ProbeRequest>) {
        let row = format_event_row(pkt, req);
        self.events.append(&row, pkt.hour_bucket());
        self.metrics.packets_seen.fetch_add(1, Relaxed);
    }

    fn handle_packet(&mut self, pkt: Packet) {
        match &pkt.proto {
            Proto::Tcp(tcp) => {
                if !self.tuning.enable_tcp {
                    return;
                }
                let syn_only = tcp.syn && !tcp.ack && !tcp.rst;
                let ack_only = !tcp.syn && tcp.ack;

                if syn_only {
                    let uid = self.next_id();
                    let req = ProbeRequest {
                        method: ProbeMethod::TcpSynAck,
                        saddr: pkt.daddr,
                        daddr: pkt.saddr,
                        sport: tcp.dport,
                        dport: tcp.sport,
                        snum: 0,
                        anum: tcp
                            .snum
                            .wrapping_add(tcp.payload.len() as u32)
                            .wrapping_add(1),
                        user_id: uid,
                        payload: Vec::new(),
                        num_probes: self.tuning.tcp_synack_probes,
                    };
                    self.metrics.tcp_synack_sent.fetch_add(1, Relaxed);
                    self.send_submit_tcp(req.clone());
                    self.log_event(&pkt, Some(&req));
                } else if ack_only {
                    let ep = Endpoint {
                        addr: pkt.saddr,
                        port: tcp.sport,
                    };
                    if self.rst_scheduled.contains(&ep) {
                        self.metrics.tcp_rst_dropped_duplicate.fetch_add(1, Relaxed);
                        return;
                    }
                    self.rst_scheduled.insert(ep);
                    let uid = self.next_id();
                    let req = ProbeRequest {
                        method: ProbeMethod::TcpRst,
                        saddr: pkt.daddr,
                        daddr: pkt.saddr,
                        sport: tcp.dport,
                        dport: tcp.sport,
                        snum: tcp.anum,
                        anum: 0,
                        user_id: uid,
                        payload: Vec::new(),
                        num_probes: self.tuning.tcp_rst_probes,
                    };
                    self.metrics.tcp_rst_scheduled.fetch_add(1, Relaxed);
                    self.log_event(&pkt, Some(&req));
                    self.schedule_delayed_rst(req);
                } else if tcp.fin {
                    self.log_event(&pkt, None);
                } else {
                    self.log_event(&pkt, None);
                }
            }
            Proto::Udp(udp) => {
                if !self.tuning.enable_udp {
                    return;
                }
                let uid = self.next_id();
                let payload = if self.tuning.udp_reflect {
                    udp.payload.clone()
                } else {
                    Vec::new() // resolved by the driver's configured default
                };
                let req = ProbeRequest {
                    method: ProbeMethod::Udp,
                    saddr: pkt.daddr,
                    daddr: pkt.saddr,
                    sport: udp.dport,
                    dport: udp.sport,
                    snum: 0,
                    anum: 0,
                    user_id: uid,
                    payload,
                    num_probes: self.tuning.udp_probes,
                };
                self.metrics.udp_probes_sent.fetch_add(1, Relaxed);
                self.send_submit_udp(req.clone());
                self.log_event(&pkt, Some(&req));
            }
            Proto::Icmp(icmp) => {
                if !self.tuning.enable_icmp {
                    return;
                }
                if icmp.kind != crate::packet::IcmpType::EchoReply {
                    let uid = self.next_id();
                    let req = ProbeRequest {
                        method: ProbeMethod::IcmpEcho,
                        saddr: pkt.daddr,
                        daddr: pkt.saddr,
                        sport: 0,
                        dport: 0,
                        snum: 0,
                        anum: 0,
                        user_id: uid,
                        payload: Vec::new(),
                        num_probes: self.tuning.icmp_probes,
                    };
                    self.metrics.icmp_probes_sent.fetch_add(1, Relaxed);
                    self.send_submit_icmp(req.clone());
                    self.log_event(&pkt, Some(&req));
                } else {
                    // Echo-reply: log-only, deliberately not the original's
                    // unconditional (and effectively empty) request row —
                    // see SPEC_FULL.md §4.2.
                    self.log_event(&pkt, None);
                }
            }
        }
    }

    fn send_submit_tcp(&self, req: ProbeRequest) {
        if let Some(tx) = &self.tcp_manager {
            let _ = tx.send(ManagerMsg::Submit {
                is_scanner_like: false,
                req,
            });
        }
    }

    fn send_submit_udp(&self, req: ProbeRequest) {
        if let Some(tx) = &self.udp_manager {
            let is_scanner_like = false;
            let _ = tx.send(ManagerMsg::Submit { req, is_scanner_like });
        }
    }

    fn send_submit_icmp(&self, req: ProbeRequest) {
        if let Some(tx) = &self.icmp_manager {
            let _ = tx.send(ManagerMsg::Submit {
                req,
                is_scanner_like: false,
            });
        }
    }

    /// Mirrors `delayed_send(self, reset_delay, req)`: a side thread sleeps
    /// and then re-delivers the request to this shard's own mailbox.
    fn schedule_delayed_rst(&self, req: ProbeRequest) {
        let tx = self.self_tx.clone();
        let delay = self.tuning.reset_delay;
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            let _ = tx.send(ShardMsg::DelayedRst(req));
        });
    }

    /// Invoked when the delayed RST message comes back around: clear the
    /// endpoint from `rst_scheduled` and forward the request to the TCP
    /// prober manager.
    fn forward_delayed_rst(&mut self, req: ProbeRequest) {
        let ep = Endpoint {
            addr: req.daddr,
            port: req.dport,
        };
        self.rst_scheduled.remove(&ep);
        self.send_submit_tcp(req);
    }
}

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    shard_index: u8,
    tuning: ShardTuning,
    tcp_manager: Option<Sender<ManagerMsg>>,
    udp_manager: Option<Sender<ManagerMsg>>,
    icmp_manager: Option<Sender<ManagerMsg>>,
    out_dir: String,
    datasource_tag: String,
    metrics: Arc<ShardMetrics>,
    reserve_size: usize,
    write_threshold: usize,
) -> Sender<ShardMsg> {
    let (tx, rx) = crossbeam_channel::unbounded::<ShardMsg>();
    let self_tx = tx.clone();

    let (handoff_tx, handoff_rx) = crossbeam_channel::unbounded();
    let events = ReplyBuffer::new(reserve_size, write_threshold, handoff_tx);

    let writer_out_dir = out_dir.clone();
    let writer_tag = datasource_tag.clone();
    std::thread::spawn(move || {
        let log_metrics = Arc::new(LogWriterMetrics::default());
        let mut writer = LogWriter::new(
            writer_out_dir,
            writer_tag,
            "mixed",
            "events",
            EVENTS_HEADER,
            log_metrics,
        );
        for handoff in handoff_rx {
            let return_to = handoff.return_to.clone();
            let mut buf = match String::from_utf8(handoff.data) {
                Ok(text) => {
                    for line in text.lines() {
                        if let Err(e) = writer.append(handoff.hour_bucket, line) {
                            tracing::warn!(error = %e, "log writer failed to append event row");
                        }
                    }
                    text.into_bytes()
                }
                Err(e) => e.into_bytes(),
            };
            buf.clear();
            let _ = return_to.send(buf);
        }
    });

    std::thread::Builder::new()
        .name(format!("spoki-shard-{shard_index}"))
        .spawn(move || {
            let mut state = ShardState {
                shard_id: (shard_index as u32) << 24,
                tag_cnt: 0,
                rst_scheduled: HashSet::new(),
                tuning,
                tcp_manager,
                udp_manager,
                icmp_manager,
                self_tx,
                events,
                metrics,
            };
            run(rx, &mut state);
        })
        .expect("spawn shard thread");

    tx
}

fn run(rx: Receiver<ShardMsg>, state: &mut ShardState) {
    for msg in rx {
        match msg {
            ShardMsg::Packet(pkt) => state.handle_packet(pkt),
            ShardMsg::DelayedRst(req) => state.forward_delayed_rst(req),
            ShardMsg::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{IcmpInfo, IcmpType, TcpInfo, UdpInfo};
    use std::net::Ipv4Addr;

    fn base_tuning() -> ShardTuning {
        ShardTuning {
            enable_tcp: true,
            enable_udp: true,
            enable_icmp: true,
            udp_reflect: true,
            reset_delay: Duration::from_millis(10),
            tcp_synack_probes: 1,
            tcp_rst_probes: 1,
            udp_probes: 1,
            icmp_probes: 1,
        }
    }

    fn test_state() -> (ShardState, Sender<ShardMsg>, Receiver<ManagerMsg>) {
        let (self_tx, _self_rx) = crossbeam_channel::unbounded();
        let (tcp_tx, tcp_rx) = crossbeam_channel::unbounded();
        let (handoff_tx, _handoff_rx) = crossbeam_channel::unbounded();
        let state = ShardState {
            shard_id: 3 << 24,
            tag_cnt: 0,
            rst_scheduled: HashSet::new(),
            tuning: base_tuning(),
            tcp_manager: Some(tcp_tx),
            udp_manager: None,
            icmp_manager: None,
            self_tx: self_tx.clone(),
            events: ReplyBuffer::new(1024, 1024 * 1024, handoff_tx),
            metrics: Arc::new(ShardMetrics::default()),
        };
        (state, self_tx, tcp_rx)
    }

    fn syn_packet() -> Packet {
        Packet {
            saddr: Ipv4Addr::new(10, 0, 0, 1),
            daddr: Ipv4Addr::new(10, 255, 0, 5),
            ipid: 1,
            ttl: 64,
            observed_secs: 3600,
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
        }
    }

    #[test]
    fn syn_only_emits_synack_with_expected_anum() {
        let (mut state, _self_tx, tcp_rx) = test_state();
        state.handle_packet(syn_packet());
        let msg = tcp_rx.try_recv().expect("should forward a synack request");
        match msg {
            ManagerMsg::Submit { req, .. } => {
                assert_eq!(req.method, ProbeMethod::TcpSynAck);
                assert_eq!(req.sport, 80);
                assert_eq!(req.dport, 40000);
                assert_eq!(req.anum, 101);
            }
            _ => panic!("expected a Submit message"),
        }
    }

    #[test]
    fn user_ids_carry_shard_id_in_upper_byte() {
        let (mut state, _self_tx, tcp_rx) = test_state();
        state.handle_packet(syn_packet());
        let ManagerMsg::Submit { req, .. } = tcp_rx.try_recv().unwrap() else {
            panic!()
        };
        assert_eq!(req.user_id >> 24, 3);
        assert_eq!(req.user_id & 0xffffff, 1);
    }

    #[test]
    fn mints_are_unique_across_a_run_and_wrap_the_low_24_bits() {
        let (mut state, _self_tx, _tcp_rx) = test_state();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = state.next_id();
            assert_eq!(id >> 24, 3, "shard_id must stay fixed in the upper byte");
            assert!(seen.insert(id), "mint {id} collided with an earlier one");
        }

        // Wraparound: push tag_cnt to TAG_CNT_MAX so the next mint wraps back
        // to 0 (property #3 is scoped to "within a window of 2^24 mints",
        // not across a wraparound — a collision there is out of scope).
        state.tag_cnt = TAG_CNT_MAX - 1;
        let before_wrap = state.next_id();
        assert_eq!(before_wrap & 0xffffff, TAG_CNT_MAX);
        let after_wrap = state.next_id();
        assert_eq!(after_wrap & 0xffffff, 0);
    }

    fn ack_packet(anum: u32) -> Packet {
        let mut p = syn_packet();
        if let Proto::Tcp(t) = &mut p.proto {
            t.syn = false;
            t.ack = true;
            t.anum = anum;
        }
        p
    }

    #[test]
    fn second_ack_on_same_endpoint_is_dropped_before_minting() {
        let (mut state, _self_tx, tcp_rx) = test_state();
        state.handle_packet(ack_packet(200));
        state.handle_packet(ack_packet(200));
        // Only the rst_scheduled bookkeeping fires; nothing is forwarded to
        // the manager yet (the RST is still pending on its delay timer).
        assert_eq!(tcp_rx.try_iter().count(), 0);
        assert_eq!(state.rst_scheduled.len(), 1);
        assert_eq!(state.metrics.snapshot().tcp_rst_dropped_duplicate, 1);
    }

    #[test]
    fn delayed_rst_forward_clears_the_endpoint_and_submits() {
        let (mut state, _self_tx, tcp_rx) = test_state();
        state.handle_packet(ack_packet(200));
        assert_eq!(state.rst_scheduled.len(), 1);
        let ep = Endpoint {
            addr: Ipv4Addr::new(10, 0, 0, 1),
            port: 40000,
        };
        let req = ProbeRequest {
            method: ProbeMethod::TcpRst,
            saddr: Ipv4Addr::new(10, 255, 0, 5),
            daddr: ep.addr,
            sport: 80,
            dport: ep.port,
            snum: 200,
            anum: 0,
            user_id: 1,
            payload: vec![],
            num_probes: 1,
        };
        state.forward_delayed_rst(req);
        assert!(!state.rst_scheduled.contains(&ep));
        assert_eq!(tcp_rx.try_iter().count(), 1);
    }

    #[test]
    fn icmp_echo_reply_is_log_only() {
        let (mut state, _self_tx, tcp_rx) = test_state();
        let p = Packet {
            saddr: Ipv4Addr::new(10, 0, 0, 1),
            daddr: Ipv4Addr::new(10, 255, 0, 5),
            ipid: 1,
            ttl: 64,
            observed_secs: 3600,
            proto: Proto::Icmp(IcmpInfo {
                kind: IcmpType::EchoReply,
            }),
        };
        state.handle_packet(p);
        assert_eq!(tcp_rx.try_iter().count(), 0);
        assert_eq!(state.metrics.snapshot().icmp_probes_sent, 0);
    }

    #[test]
    fn udp_in_reflect_mode_echoes_payload() {
        let (mut state, _self_tx, _tcp_rx) = test_state();
        let (udp_tx, udp_rx) = crossbeam_channel::unbounded();
        state.udp_manager = Some(udp_tx);
        let p = Packet {
            saddr: Ipv4Addr::new(1, 2, 3, 4),
            daddr: Ipv4Addr::new(10, 255, 0, 5),
            ipid: 1,
            ttl: 64,
            observed_secs: 3600,
            proto: Proto::Udp(UdpInfo {
                sport: 53000,
                dport: 53,
                payload: vec![0xAA, 0xBB, 0xCC],
            }),
        };
        state.handle_packet(p);
        let ManagerMsg::Submit { req, .. } = udp_rx.try_recv().unwrap() else {
            panic!()
        };
        assert_eq!(req.payload, vec![0xAA, 0xBB, 0xCC]);
        assert_eq!(req.sport, 53);
        assert_eq!(req.dport, 53000);
    }
}
