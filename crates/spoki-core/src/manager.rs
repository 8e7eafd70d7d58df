//! C3 — Prober Manager.
//!
//! One per driver: de-duplicates in-flight targets, forwards accepted
//! requests to its driver, surfaces decoded replies to the reply-log
//! stream, and emits a once-a-second accounting tick. Runs as its own
//! thread fed by a single mailbox, matching `scamper/manager.cpp`'s
//! `mgnt_data` actor state — but with the two bookkeeping bugs spec.md §4.3
//! requires fixed: dropped duplicate-target requests and stray replies are
//! both counted here instead of silently falling through.

use crate::codec::PingReply;
use crate::csv_format::{format_reply_row, REPLIES_HEADER};
use crate::driver::DriverMsg;
use crate::log_writer::LogWriter;
use crate::metrics::{DriverMetrics, LogWriterMetrics, ManagerMetrics};
use crate::packet::{align_to_hour, TargetKey};
use crate::reply_buffer::ReplyBuffer;
use crate::request::ProbeRequest;
use crossbeam_channel::{Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub enum ManagerMsg {
    Submit {
        req: ProbeRequest,
        is_scanner_like: bool,
    },
    Reply(PingReply),
    Tick,
    Shutdown,
}

struct ManagerState {
    targets: HashSet<TargetKey>,
    userids: HashMap<u32, TargetKey>,
    driver_tx: Sender<DriverMsg>,
    reply_buffer: ReplyBuffer,
    metrics: Arc<ManagerMetrics>,
}

impl ManagerState {
    fn submit(&mut self, req: ProbeRequest, is_scanner_like: bool) {
        let key = TargetKey {
            addr: req.daddr,
            is_scanner_like,
        };
        if self.targets.contains(&key) {
            self.metrics.dropped_duplicate_target.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        }
        self.targets.insert(key);
        self.userids.insert(req.user_id, key);
        self.metrics.requests_accepted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let _ = self.driver_tx.send(DriverMsg::Submit(req));
    }

    fn handle_reply(&mut self, reply: PingReply) {
        match self.userids.remove(&reply.user_id) {
            Some(key) => {
                self.targets.remove(&key);
                self.metrics.replies_returned.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let row = format_reply_row(&reply);
                let hour = align_to_hour(reply.start_sec as u64);
                self.reply_buffer.append(&row, hour);
            }
            None => {
                self.metrics.stray_replies.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }
}

/// Spawn the manager thread plus its own 1Hz ticker, and the log-writer
/// consumer thread that drains its reply buffer's handoffs.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    tag: &str,
    protocol_tag: &'static str,
    out_dir: String,
    driver_tx: Sender<DriverMsg>,
    driver_metrics: Arc<DriverMetrics>,
    metrics: Arc<ManagerMetrics>,
    reserve_size: usize,
    write_threshold: usize,
) -> (Sender<ManagerMsg>, std::thread::JoinHandle<()>) {
    let (tx, rx) = crossbeam_channel::unbounded::<ManagerMsg>();

    let (handoff_tx, handoff_rx) = crossbeam_channel::unbounded();
    let reply_buffer = ReplyBuffer::new(reserve_size, write_threshold, handoff_tx);

    let log_metrics = Arc::new(LogWriterMetrics::default());
    let writer_out_dir = out_dir.clone();
    let writer_tag = tag.to_string();
    let writer_metrics = log_metrics.clone();
    std::thread::spawn(move || {
        let mut writer = LogWriter::new(
            writer_out_dir,
            writer_tag,
            protocol_tag,
            "replies",
            REPLIES_HEADER,
            writer_metrics,
        );
        for handoff in handoff_rx {
            let return_to = handoff.return_to.clone();
            let mut buf = match String::from_utf8(handoff.data) {
                Ok(text) => {
                    for line in text.lines() {
                        if let Err(e) = writer.append(handoff.hour_bucket, line) {
                            tracing::warn!(error = %e, "log writer failed to append reply row");
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

    let ticker_tx = tx.clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(1));
        if ticker_tx.send(ManagerMsg::Tick).is_err() {
            break;
        }
    });

    let driver_metrics_for_tick = driver_metrics;
    let join = std::thread::Builder::new()
        .name(format!("spoki-manager-{protocol_tag}"))
        .spawn(move || run(rx, driver_tx, reply_buffer, metrics, driver_metrics_for_tick))
        .expect("spawn manager thread");

    (tx, join)
}

fn run(
    rx: Receiver<ManagerMsg>,
    driver_tx: Sender<DriverMsg>,
    reply_buffer: ReplyBuffer,
    metrics: Arc<ManagerMetrics>,
    driver_metrics: Arc<DriverMetrics>,
) {
    let mut state = ManagerState {
        targets: HashSet::new(),
        userids: HashMap::new(),
        driver_tx,
        reply_buffer,
        metrics: metrics.clone(),
    };

    let mut prev = metrics.snapshot();

    for msg in rx {
        match msg {
            ManagerMsg::Submit { req, is_scanner_like } => state.submit(req, is_scanner_like),
            ManagerMsg::Reply(reply) => state.handle_reply(reply),
            ManagerMsg::Tick => {
                let cur = metrics.snapshot();
                let drv = driver_metrics.snapshot();
                tracing::info!(
                    rps = cur.requests_accepted.saturating_sub(prev.requests_accepted),
                    replies = cur.replies_returned.saturating_sub(prev.replies_returned),
                    dropped = cur.dropped_duplicate_target.saturating_sub(prev.dropped_duplicate_target),
                    strays = cur.stray_replies.saturating_sub(prev.stray_replies),
                    queue_size = drv.queue_depth,
                    "prober manager accounting tick"
                );
                prev = cur;
            }
            ManagerMsg::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ProbeMethod;
    use std::net::Ipv4Addr;

    fn req(daddr: Ipv4Addr, user_id: u32) -> ProbeRequest {
        ProbeRequest {
            method: ProbeMethod::TcpSynAck,
            saddr: Ipv4Addr::new(10, 255, 0, 5),
            daddr,
            sport: 80,
            dport: 40000,
            snum: 0,
            anum: 0,
            user_id,
            payload: vec![],
            num_probes: 1,
        }
    }

    fn test_state() -> (ManagerState, Receiver<DriverMsg>, crossbeam_channel::Receiver<crate::reply_buffer::BufferHandoff>) {
        let (driver_tx, driver_rx) = crossbeam_channel::unbounded();
        let (handoff_tx, handoff_rx) = crossbeam_channel::unbounded();
        let state = ManagerState {
            targets: HashSet::new(),
            userids: HashMap::new(),
            driver_tx,
            reply_buffer: ReplyBuffer::new(1024, 1024 * 1024, handoff_tx),
            metrics: Arc::new(ManagerMetrics::default()),
        };
        (state, driver_rx, handoff_rx)
    }

    #[test]
    fn duplicate_target_is_dropped_and_counted() {
        let (mut state, driver_rx, _handoff) = test_state();
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        state.submit(req(addr, 1), false);
        state.submit(req(addr, 2), false);
        assert_eq!(driver_rx.try_iter().count(), 1);
        assert_eq!(state.metrics.snapshot().dropped_duplicate_target, 1);
    }

    #[test]
    fn unknown_user_id_counted_as_stray() {
        let (mut state, _driver_rx, _handoff) = test_state();
        let reply = PingReply {
            start_sec: 0,
            start_usec: 0,
            method: ProbeMethod::Udp,
            user_id: 999,
            ping_sent: 1,
            src: Ipv4Addr::new(1, 1, 1, 1),
            dst: Ipv4Addr::new(2, 2, 2, 2),
            sport: 1,
            dport: 2,
        };
        state.handle_reply(reply);
        assert_eq!(state.metrics.snapshot().stray_replies, 1);
    }

    #[test]
    fn matched_reply_frees_the_target_key() {
        let (mut state, _driver_rx, _handoff) = test_state();
        let addr = Ipv4Addr::new(10, 0, 0, 2);
        state.submit(req(addr, 5), false);
        assert!(state.targets.contains(&TargetKey {
            addr,
            is_scanner_like: false
        }));
        state.handle_reply(PingReply {
            start_sec: 0,
            start_usec: 0,
            method: ProbeMethod::TcpSynAck,
            user_id: 5,
            ping_sent: 1,
            src: Ipv4Addr::new(10, 255, 0, 5),
            dst: addr,
            sport: 80,
            dport: 40000,
        });
        assert!(!state.targets.contains(&TargetKey {
            addr,
            is_scanner_like: false
        }));
        // Now a resubmit for the same target should be accepted again.
        state.submit(req(addr, 6), false);
        assert_eq!(state.metrics.snapshot().dropped_duplicate_target, 0);
    }
}
