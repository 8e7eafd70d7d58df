//! `spoki run` — starts the reactor and blocks until the capture input ends.
//!
//! Unlike the teacher's background daemon (a separate metrics-logging loop
//! polled by a TUI), the reactor logs its own periodic accounting ticks
//! directly through `tracing` (one line per prober manager per second, plus
//! the Scamper driver's queue depth) — see `spoki_core::manager`.

use anyhow::Result;
use spoki_core::ReactorConfig;
use std::path::Path;

use crate::ingest;

pub fn run(config: &ReactorConfig, input: Option<&Path>) -> Result<()> {
    tracing::info!(
        shards = config.shards,
        out_dir = %config.out_dir,
        "starting spoki reactor"
    );

    let packets = ingest::spawn(input)?;
    spoki_core::reactor::run(config, packets)?;

    tracing::info!("capture input ended, reactor shut down");
    Ok(())
}
