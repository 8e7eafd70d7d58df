//! spoki-core: the reactive darknet telescope's packet-to-probe pipeline.
//!
//! Pure logic and per-component state machines live here, independent of
//! any particular capture source or CLI surface — those are wired together
//! by the `spoki` binary crate's `run` module.

pub mod codec;
pub mod config;
pub mod csv_format;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod log_writer;
pub mod manager;
pub mod metrics;
pub mod packet;
pub mod reactor;
pub mod reply_buffer;
pub mod request;
pub mod shard;

pub use codec::{decode_object, make_command, parse_control_line, PingReply, ScamperLine};
pub use config::ReactorConfig;
pub use dispatcher::{dispatch, shard_for_addr};
pub use driver::{DriverHandle, DriverMsg};
pub use error::ErrorKind;
pub use log_writer::LogWriter;
pub use manager::ManagerMsg;
pub use packet::{align_to_hour, Endpoint, IcmpInfo, IcmpType, Packet, Proto, TargetKey, TcpInfo, UdpInfo};
pub use reactor::Reactor;
pub use reply_buffer::ReplyBuffer;
pub use request::{ProbeMethod, ProbeRequest};
pub use shard::{ShardMsg, ShardTuning};
