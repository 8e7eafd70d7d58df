//! Stand-in capture adapter.
//!
//! The reactor's actual capture source (a library that delivers already-
//! parsed IPv4/TCP/UDP/ICMP records) is out of scope (`spec.md` §1). This
//! module reads the same `Packet` schema as newline-delimited JSON from a
//! file or stdin, so the reactor can be run and its per-packet behavior
//! observed without a live darknet feed. A production deployment swaps this
//! module out for a real capture library feeding the same
//! `crossbeam_channel::Sender<Packet>`.

use anyhow::Context;
use spoki_core::{ErrorKind, Packet};
use std::io::BufRead;
use std::path::Path;

/// Spawn a thread that reads one JSON-encoded `Packet` per line from
/// `input` (or stdin if `None`) and forwards it into the returned channel.
/// Malformed lines are logged and skipped rather than aborting the run.
pub fn spawn(input: Option<&Path>) -> anyhow::Result<crossbeam_channel::Receiver<Packet>> {
    let (tx, rx) = crossbeam_channel::bounded(4096);

    let reader: Box<dyn BufRead + Send> = match input {
        Some(path) => {
            let f = std::fs::File::open(path)
                .with_context(|| format!("failed to open capture input: {}", path.display()))?;
            Box::new(std::io::BufReader::new(f))
        }
        None => Box::new(std::io::BufReader::new(std::io::stdin())),
    };

    std::thread::Builder::new()
        .name("spoki-ingest".into())
        .spawn(move || {
            for line in reader.lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::warn!(error = %e, "capture input read error, stopping ingest");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Packet>(&line) {
                    Ok(pkt) => {
                        if tx.send(pkt).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            kind = %ErrorKind::MalformedPacket.as_str(),
                            "dropping malformed capture record"
                        );
                    }
                }
            }
        })?;

    Ok(rx)
}
