//! Error categorization per §7. Propagation itself stays on `anyhow::Result`
//! at fallible boundaries (socket connect, file I/O, config parse); this enum
//! only tags which of the seven kinds an event belongs to, so logs and
//! metrics can be grouped by kind without a full error-type hierarchy.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    StartupFatal,
    TransientIo,
    ProtocolViolation,
    DecodeFailure,
    MalformedPacket,
    SupervisorDeath,
    MisbucketedRecord,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::StartupFatal => "startup_fatal",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::DecodeFailure => "decode_failure",
            ErrorKind::MalformedPacket => "malformed_packet",
            ErrorKind::SupervisorDeath => "supervisor_death",
            ErrorKind::MisbucketedRecord => "misbucketed_record",
        }
    }
}
