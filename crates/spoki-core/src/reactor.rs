//! The core's single startup function (§6): given a `ReactorConfig` and a
//! channel of capture records, wire up the Dispatcher, Shards, Prober
//! Managers and Scamper Drivers, and run until the capture channel closes
//! or a shutdown is requested. Nothing here knows where packets actually
//! come from — that's the capture library's job, out of scope per §1.

use crate::config::ReactorConfig;
use crate::dispatcher;
use crate::driver;
use crate::manager::{self, ManagerMsg};
use crate::metrics::{DispatcherMetrics, DriverMetrics, ManagerMetrics, ShardMetrics};
use crate::packet::Packet;
use crate::shard::{self, ShardMsg, ShardTuning};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::Duration;

/// One protocol's manager+driver pair, running.
struct ProtocolPipeline {
    manager_tx: crossbeam_channel::Sender<ManagerMsg>,
    manager_join: std::thread::JoinHandle<()>,
    driver: Option<driver::DriverHandle>,
}

/// Everything spawned by [`run`], kept around so `shutdown` can unwind it in
/// dependency order: shards first (so they stop minting new requests), then
/// managers, then drivers.
pub struct Reactor {
    shard_txs: Vec<crossbeam_channel::Sender<ShardMsg>>,
    tcp: Option<ProtocolPipeline>,
    udp: Option<ProtocolPipeline>,
    icmp: Option<ProtocolPipeline>,
    dispatcher_metrics: Arc<DispatcherMetrics>,
    shard_count: usize,
}

#[allow(clippy::too_many_arguments)]
fn spawn_protocol(
    tag: &str,
    protocol: &'static str,
    endpoint: Option<&str>,
    out_dir: &str,
    udp_default_payload_hex: &str,
    reserve_size: usize,
    write_threshold: usize,
) -> anyhow::Result<Option<ProtocolPipeline>> {
    let Some(endpoint) = endpoint else {
        return Ok(None);
    };

    let driver_metrics = Arc::new(DriverMetrics::default());
    let manager_metrics = Arc::new(ManagerMetrics::default());

    let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
    let (driver_handle, _driver_ingress_rx) = driver::spawn(
        endpoint.to_string(),
        reply_tx,
        udp_default_payload_hex.to_string(),
        driver_metrics.clone(),
    )?;

    let (manager_tx, manager_join) = manager::spawn(
        tag,
        protocol,
        out_dir.to_string(),
        driver_handle.ingress.clone(),
        driver_metrics,
        manager_metrics,
        reserve_size,
        write_threshold,
    );

    let bridge_tx = manager_tx.clone();
    let bridge_protocol = protocol;
    std::thread::Builder::new()
        .name(format!("spoki-reply-bridge-{protocol}"))
        .spawn(move || {
            for reply in reply_rx {
                if bridge_tx.send(ManagerMsg::Reply(reply)).is_err() {
                    tracing::warn!(
                        protocol = bridge_protocol,
                        kind = %crate::error::ErrorKind::SupervisorDeath.as_str(),
                        "prober manager mailbox gone, reply bridge stopping"
                    );
                    break;
                }
            }
        })?;

    Ok(Some(ProtocolPipeline {
        manager_tx,
        manager_join,
        driver: Some(driver_handle),
    }))
}

/// Build and start the whole reactor. Blocks the calling thread, consuming
/// `packets` until the sender side is dropped (capture stopped) or a
/// `Ctrl-C`/signal handler upstream drops it to request shutdown.
pub fn run(config: &ReactorConfig, packets: Receiver<Packet>) -> anyhow::Result<()> {
    let mut reactor = start(config)?;
    for pkt in &packets {
        if !config.source_filter.is_empty() && !config.source_filter.contains(&pkt.saddr) {
            continue;
        }
        let Some(idx) = dispatcher::dispatch(&pkt, reactor.shard_count, &reactor.dispatcher_metrics) else {
            continue;
        };
        let _ = reactor.shard_txs[idx].send(ShardMsg::Packet(pkt));
    }
    reactor.shutdown();
    Ok(())
}

/// Spawn every thread the reactor needs without blocking; returns a handle
/// the caller can feed packets into by hand (used by tests and by
/// `run` above).
pub fn start(config: &ReactorConfig) -> anyhow::Result<Reactor> {
    std::fs::create_dir_all(&config.out_dir)?;

    let tcp = if config.enable_tcp {
        spawn_protocol(
            &config.datasource_tag,
            "tcp",
            config.daemons.tcp.as_deref(),
            &config.out_dir,
            &config.udp_default_payload_hex,
            config.reply_buffer.reserve_size,
            config.reply_buffer.write_threshold,
        )?
    } else {
        None
    };
    let udp = if config.enable_udp {
        spawn_protocol(
            &config.datasource_tag,
            "udp",
            config.daemons.udp.as_deref(),
            &config.out_dir,
            &config.udp_default_payload_hex,
            config.reply_buffer.reserve_size,
            config.reply_buffer.write_threshold,
        )?
    } else {
        None
    };
    let icmp = if config.enable_icmp {
        spawn_protocol(
            &config.datasource_tag,
            "icmp",
            config.daemons.icmp.as_deref(),
            &config.out_dir,
            &config.udp_default_payload_hex,
            config.reply_buffer.reserve_size,
            config.reply_buffer.write_threshold,
        )?
    } else {
        None
    };

    let tuning = ShardTuning {
        enable_tcp: config.enable_tcp && tcp.is_some(),
        enable_udp: config.enable_udp && udp.is_some(),
        enable_icmp: config.enable_icmp && icmp.is_some(),
        udp_reflect: config.udp_reflect,
        reset_delay: Duration::from_millis(config.reset_delay_ms),
        tcp_synack_probes: config.tcp_synack_probes,
        tcp_rst_probes: config.tcp_rst_probes,
        udp_probes: config.udp_probes,
        icmp_probes: config.icmp_probes,
    };

    let shard_txs: Vec<_> = (0..config.shards)
        .map(|i| {
            shard::spawn(
                i as u8,
                tuning,
                tcp.as_ref().map(|p| p.manager_tx.clone()),
                udp.as_ref().map(|p| p.manager_tx.clone()),
                icmp.as_ref().map(|p| p.manager_tx.clone()),
                config.out_dir.clone(),
                config.datasource_tag.clone(),
                Arc::new(ShardMetrics::default()),
                config.reply_buffer.reserve_size,
                config.reply_buffer.write_threshold,
            )
        })
        .collect();

    Ok(Reactor {
        shard_txs,
        tcp,
        udp,
        icmp,
        dispatcher_metrics: Arc::new(DispatcherMetrics::default()),
        shard_count: config.shards,
    })
}

impl Reactor {
    pub fn dispatch(&self, pkt: Packet) {
        if let Some(idx) = dispatcher::dispatch(&pkt, self.shard_count, &self.dispatcher_metrics) {
            let _ = self.shard_txs[idx].send(ShardMsg::Packet(pkt));
        }
    }

    pub fn shutdown(&mut self) {
        for tx in &self.shard_txs {
            let _ = tx.send(ShardMsg::Shutdown);
        }
        for pipeline in [self.tcp.take(), self.udp.take(), self.icmp.take()]
            .into_iter()
            .flatten()
        {
            let _ = pipeline.manager_tx.send(ManagerMsg::Shutdown);
            let _ = pipeline.manager_join.join();
            if let Some(mut driver) = pipeline.driver {
                driver.shutdown();
            }
        }
    }
}
