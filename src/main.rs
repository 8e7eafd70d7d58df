//! spoki — reactive network telescope.
//!
//! Observes unsolicited darknet traffic and synthesizes per-packet probe
//! replies within a short window via a Scamper daemon. Run `spoki --help`
//! for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod ingest;
mod run;

use cli::{Cli, Commands};
use spoki_core::ReactorConfig;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let example = ReactorConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Run { input } => {
            if !cli.config.exists() {
                anyhow::bail!(
                    "config file '{}' not found — run `spoki init > {}` first",
                    cli.config.display(),
                    cli.config.display()
                );
            }
            let config = ReactorConfig::load(&cli.config)?;
            run::run(&config, input.as_deref())?;
        }
    }

    Ok(())
}
