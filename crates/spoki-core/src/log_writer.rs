//! C1 — Log Writer.
//!
//! Hour-bucketed, append-only CSV writer with a rolling two-file window.
//! One `LogWriter` owns one `(protocol, component)` stream — e.g. "tcp
//! events" or "udp replies" — and is fed hour-tagged buffers by one or more
//! Reply Buffers (C6). The state machine here is the exact Idle/OneLog/
//! TwoLogs table from the original `collector.cpp`.

use crate::error::ErrorKind;
use crate::metrics::LogWriterMetrics;
use chrono::{TimeZone, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Idle,
    OneLog,
    TwoLogs,
}

pub struct LogWriter {
    out_dir: PathBuf,
    datasource_tag: String,
    protocol_tag: &'static str,
    component_tag: &'static str,
    header: &'static str,
    state: WriterState,
    cur: Option<u64>,
    prev: Option<u64>,
    cur_file: Option<File>,
    prev_file: Option<File>,
    metrics: Arc<LogWriterMetrics>,
}

impl LogWriter {
    pub fn new(
        out_dir: impl Into<PathBuf>,
        datasource_tag: impl Into<String>,
        protocol_tag: &'static str,
        component_tag: &'static str,
        header: &'static str,
        metrics: Arc<LogWriterMetrics>,
    ) -> Self {
        LogWriter {
            out_dir: out_dir.into(),
            datasource_tag: datasource_tag.into(),
            protocol_tag,
            component_tag,
            header,
            state: WriterState::Idle,
            cur: None,
            prev: None,
            cur_file: None,
            prev_file: None,
            metrics,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// File name is deterministic: human-readable hour timestamp, datasource
    /// tag, protocol tag, component tag, integer hour start, `.csv`.
    fn file_name(&self, hour_start: u64) -> PathBuf {
        let human = Utc
            .timestamp_opt(hour_start as i64, 0)
            .single()
            .map(|dt| dt.format("%Y%m%dT%H%M%S").to_string())
            .unwrap_or_else(|| hour_start.to_string());
        self.out_dir.join(format!(
            "{}_{}_{}_{}_{}.csv",
            human, self.datasource_tag, self.protocol_tag, self.component_tag, hour_start
        ))
    }

    fn open_for_append(&self, hour_start: u64) -> anyhow::Result<File> {
        let path = self.file_name(hour_start);
        let is_new = !path.exists();
        std::fs::create_dir_all(&self.out_dir)?;
        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        if is_new {
            writeln!(f, "{}", self.header)?;
        }
        Ok(f)
    }

    fn write_line(file: &mut File, line: &str) -> anyhow::Result<()> {
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Append one CSV line, tagged with the hour bucket it belongs to.
    /// Drives the Idle -> OneLog -> TwoLogs machine per §4.6.
    pub fn append(&mut self, hour: u64, line: &str) -> anyhow::Result<()> {
        match self.state {
            WriterState::Idle => {
                self.cur = Some(hour);
                self.prev = Some(hour.saturating_sub(3600));
                let mut f = self.open_for_append(hour)?;
                Self::write_line(&mut f, line)?;
                self.cur_file = Some(f);
                self.state = WriterState::OneLog;
            }
            WriterState::OneLog => {
                let cur = self.cur.expect("OneLog implies cur set");
                let prev = self.prev.expect("OneLog implies prev set");
                if hour == cur {
                    Self::write_line(self.cur_file.as_mut().unwrap(), line)?;
                } else if hour == cur + 3600 {
                    self.prev_file = self.cur_file.take();
                    self.prev = Some(cur);
                    self.cur = Some(hour);
                    let mut f = self.open_for_append(hour)?;
                    Self::write_line(&mut f, line)?;
                    self.cur_file = Some(f);
                    self.state = WriterState::TwoLogs;
                } else if hour > cur + 3600 {
                    self.cur_file = None;
                    self.cur = Some(hour);
                    self.prev = Some(hour.saturating_sub(3600));
                    let mut f = self.open_for_append(hour)?;
                    Self::write_line(&mut f, line)?;
                    self.cur_file = Some(f);
                } else if hour == prev {
                    let mut f = self.open_for_append(hour)?;
                    Self::write_line(&mut f, line)?;
                    self.prev_file = Some(f);
                    self.state = WriterState::TwoLogs;
                } else {
                    self.reject_too_old(hour, prev);
                }
            }
            WriterState::TwoLogs => {
                let cur = self.cur.expect("TwoLogs implies cur set");
                let prev = self.prev.expect("TwoLogs implies prev set");
                if hour == cur {
                    Self::write_line(self.cur_file.as_mut().unwrap(), line)?;
                } else if hour == prev {
                    Self::write_line(self.prev_file.as_mut().unwrap(), line)?;
                } else if hour == cur + 3600 {
                    self.prev_file = self.cur_file.take();
                    self.prev = Some(cur);
                    self.cur = Some(hour);
                    let mut f = self.open_for_append(hour)?;
                    Self::write_line(&mut f, line)?;
                    self.cur_file = Some(f);
                    // remains TwoLogs
                } else if hour > cur + 3600 {
                    self.cur_file = None;
                    self.prev_file = None;
                    self.cur = Some(hour);
                    self.prev = Some(hour.saturating_sub(3600));
                    let mut f = self.open_for_append(hour)?;
                    Self::write_line(&mut f, line)?;
                    self.cur_file = Some(f);
                    self.state = WriterState::OneLog;
                } else {
                    self.reject_too_old(hour, prev);
                }
            }
        }
        self.metrics.records_written.fetch_add(1, Relaxed);
        Ok(())
    }

    fn reject_too_old(&self, hour: u64, prev: u64) {
        tracing::warn!(
            hour,
            prev,
            kind = %ErrorKind::MisbucketedRecord.as_str(),
            "log record older than the writer's window, dropping"
        );
        self.metrics.misbucketed_dropped.fetch_add(1, Relaxed);
    }
}
