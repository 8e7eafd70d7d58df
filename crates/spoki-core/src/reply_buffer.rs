//! C6 — Reply Buffer.
//!
//! One per shard-and-stream (e.g. a shard's TCP events, or its ICMP
//! replies). Accumulates CSV lines into a byte buffer tagged with the hour
//! bucket of the records it holds, and hands the whole buffer to the Log
//! Writer in one piece when it either fills past a threshold or sees a
//! record from a different hour. A bounded return channel recycles flushed
//! buffers back to the writer side instead of reallocating every flush.

use crossbeam_channel::{Receiver, Sender};

/// One flushed buffer in flight to the Log Writer, carrying its own return
/// path so the writer thread can hand the allocation back once it has
/// copied/written the bytes out.
pub struct BufferHandoff {
    pub hour_bucket: u64,
    pub data: Vec<u8>,
    pub return_to: Sender<Vec<u8>>,
}

pub struct ReplyBuffer {
    buf: Vec<u8>,
    hour_bucket: Option<u64>,
    write_threshold: usize,
    reserve_size: usize,
    handoff_tx: Sender<BufferHandoff>,
    spare_rx: Receiver<Vec<u8>>,
    spare_tx: Sender<Vec<u8>>,
}

impl ReplyBuffer {
    pub fn new(
        reserve_size: usize,
        write_threshold: usize,
        handoff_tx: Sender<BufferHandoff>,
    ) -> Self {
        let (spare_tx, spare_rx) = crossbeam_channel::unbounded();
        ReplyBuffer {
            buf: Vec::with_capacity(reserve_size),
            hour_bucket: None,
            write_threshold,
            reserve_size,
            handoff_tx,
            spare_rx,
            spare_tx,
        }
    }

    /// Clone of the return channel to hand to the consumer side so it can
    /// give buffers back after writing them out.
    pub fn return_channel(&self) -> Sender<Vec<u8>> {
        self.spare_tx.clone()
    }

    /// Append one already-CSV-encoded line, tagged with the hour bucket its
    /// record belongs to.
    pub fn append(&mut self, line: &str, hour_bucket: u64) {
        if let Some(cur) = self.hour_bucket {
            if cur != hour_bucket {
                self.flush();
            }
        }
        if self.hour_bucket.is_none() {
            self.hour_bucket = Some(hour_bucket);
        }
        self.buf.extend_from_slice(line.as_bytes());
        self.buf.push(b'\n');
        if self.buf.len() >= self.write_threshold {
            self.flush();
        }
    }

    /// Hand off the current buffer (if non-empty) to the Log Writer and
    /// swap in a spare if one has been returned, else allocate fresh.
    pub fn flush(&mut self) {
        let Some(hour_bucket) = self.hour_bucket.take() else {
            return;
        };
        if self.buf.is_empty() {
            return;
        }
        let next = self
            .spare_rx
            .try_recv()
            .unwrap_or_else(|_| Vec::with_capacity(self.reserve_size));
        let full = std::mem::replace(&mut self.buf, next);
        let _ = self.handoff_tx.send(BufferHandoff {
            hour_bucket,
            data: full,
            return_to: self.spare_tx.clone(),
        });
    }
}
