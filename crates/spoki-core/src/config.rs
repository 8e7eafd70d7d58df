//! Reactor configuration, loaded once at startup and handed to the core.
//!
//! CLI parsing and path resolution around this are the binary crate's job;
//! this struct is the core's actual contract (§6).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReactorConfig {
    pub shards: usize,
    pub ingest_threads: usize,
    pub batch_size: usize,
    pub out_dir: String,
    pub datasource_tag: String,

    pub daemons: DaemonEndpoints,

    pub enable_tcp: bool,
    pub enable_udp: bool,
    pub enable_icmp: bool,
    pub udp_reflect: bool,
    pub udp_default_payload_hex: String,

    pub reset_delay_ms: u64,
    pub tcp_synack_probes: u16,
    pub tcp_rst_probes: u16,
    pub udp_probes: u16,
    pub icmp_probes: u16,

    pub reply_buffer: ReplyBufferConfig,

    /// Only packets whose source address is in this set are processed, when
    /// non-empty. An empty set means "accept everything" (darknet capture
    /// already restricts the address space upstream).
    pub source_filter: HashSet<Ipv4Addr>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonEndpoints {
    pub tcp: Option<String>,
    pub udp: Option<String>,
    pub icmp: Option<String>,
}

impl Default for DaemonEndpoints {
    fn default() -> Self {
        DaemonEndpoints {
            tcp: Some("127.0.0.1:31337".to_string()),
            udp: Some("127.0.0.1:31338".to_string()),
            icmp: Some("127.0.0.1:31339".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplyBufferConfig {
    pub reserve_size: usize,
    pub write_threshold: usize,
}

impl Default for ReplyBufferConfig {
    fn default() -> Self {
        ReplyBufferConfig {
            reserve_size: 64 * 1024,
            write_threshold: 256 * 1024,
        }
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            shards: 4,
            ingest_threads: 1,
            batch_size: 256,
            out_dir: "./spoki-logs".to_string(),
            datasource_tag: "darknet".to_string(),
            daemons: DaemonEndpoints::default(),
            enable_tcp: true,
            enable_udp: true,
            enable_icmp: true,
            udp_reflect: false,
            udp_default_payload_hex: "0a".to_string(),
            reset_delay_ms: 30,
            tcp_synack_probes: 1,
            tcp_rst_probes: 1,
            udp_probes: 1,
            icmp_probes: 1,
            reply_buffer: ReplyBufferConfig::default(),
            source_filter: HashSet::new(),
        }
    }
}

impl ReactorConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: ReactorConfig = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.shards == 0 {
            anyhow::bail!("shards must be at least 1");
        }
        if self.shards > 256 {
            // shard_id occupies the upper 8 bits of a user_id (spec.md §4.2).
            anyhow::bail!("shards must be at most 256");
        }
        if self.out_dir.is_empty() {
            anyhow::bail!("out_dir must not be empty");
        }
        Ok(())
    }

    pub fn default_example() -> Self {
        ReactorConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ReactorConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_shards_rejected() {
        let mut cfg = ReactorConfig::default();
        cfg.shards = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn more_than_256_shards_rejected() {
        let mut cfg = ReactorConfig::default();
        cfg.shards = 257;
        assert!(cfg.validate().is_err());
    }
}
