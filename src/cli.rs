//! CLI definitions for spoki.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "spoki",
    version,
    about = "Reactive network telescope — synthesizes per-packet probe replies to darknet traffic",
    long_about = None
)]
pub struct Cli {
    /// Path to the reactor config file
    #[clap(long, short, default_value = "spoki.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the reactor: read capture records and synthesize probe replies
    Run {
        /// Read capture records (one JSON `Packet` per line) from this file
        /// instead of stdin. A real deployment sits behind a capture
        /// library instead; this is the development/offline-replay path.
        #[clap(long)]
        input: Option<PathBuf>,
    },

    /// Print an example spoki.toml to stdout
    Init,
}
