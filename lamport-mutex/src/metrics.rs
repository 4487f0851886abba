//! Per-node message counters and the metrics log file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
};

/// Running counters for one node.
///
/// Protocol messages are counted as the messages a node spends on its own
/// critical sections: each `request` and `release` sent to a peer, and each
/// `reply` received. Replies sent on behalf of other nodes are not counted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    pub application_sent: u64,
    pub application_received: u64,
    pub protocol_msgs: u64,
}

/// Numbers recorded for one completed critical-section cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleMetrics {
    pub protocol_msgs: u64,
    pub delay: Duration,
}

impl CycleMetrics {
    /// Builds the cycle numbers from the protocol counter before and after.
    pub fn between(before: &Metrics, after: &Metrics, delay: Duration) -> Self {
        Self {
            protocol_msgs: after.protocol_msgs.saturating_sub(before.protocol_msgs),
            delay,
        }
    }
}

pub fn header_line() -> String {
    format!("{:<12} {:<12}", "proto_msgs", "delay_duration")
}

pub fn cycle_line(cycle: &CycleMetrics) -> String {
    format!("{:<12} {:<12}", cycle.protocol_msgs, cycle.delay.as_millis())
}

pub fn summary_line(metrics: &Metrics) -> String {
    format!("total application messages sent: {}", metrics.application_sent)
}

/// Append-only metrics file, `node<id>.log`.
pub struct MetricsLog {
    path: PathBuf,
    file: File,
}

impl MetricsLog {
    /// Creates (or truncates) the file and writes the header.
    pub async fn create(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open metrics log {}", path.display()))?;
        let mut log = Self { path, file };
        log.write_line(&header_line()).await?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record_cycle(&mut self, cycle: &CycleMetrics) -> Result<()> {
        self.write_line(&cycle_line(cycle)).await
    }

    pub async fn write_summary(&mut self, metrics: &Metrics) -> Result<()> {
        self.write_line(&summary_line(metrics)).await
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.file
            .write_all(&buf)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        self.file
            .flush()
            .await
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }
}
