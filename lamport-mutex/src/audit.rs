//! Shared audit log of critical-section entries and exits.
//!
//! All nodes, possibly in different processes, append to the same file. Each
//! record is a single fixed-width line written with one `write_all` on a file
//! opened in append mode, so records from different writers never interleave.
//! [`verify`] replays a finished log and checks mutual exclusion.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail, ensure};

use crate::message::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Entering,
    Leaving,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // pad() keeps the caller's width flags working.
        match self {
            AuditAction::Entering => f.pad("Entering"),
            AuditAction::Leaving => f.pad("Leaving"),
        }
    }
}

impl FromStr for AuditAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Entering" => Ok(AuditAction::Entering),
            "Leaving" => Ok(AuditAction::Leaving),
            other => Err(anyhow!("unknown audit action '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditRecord {
    pub node: NodeId,
    pub action: AuditAction,
    pub timestamp: u64,
}

impl AuditRecord {
    pub fn to_line(&self) -> String {
        format!("{:<5} {:<10} {:<6}", self.node, self.action, self.timestamp)
    }

    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [node, action, timestamp] = parts.as_slice() else {
            bail!("expected '<node> <action> <timestamp>', got '{line}'");
        };
        Ok(Self {
            node: node
                .parse()
                .with_context(|| format!("invalid node id in '{line}'"))?,
            action: action.parse()?,
            timestamp: timestamp
                .parse()
                .with_context(|| format!("invalid timestamp in '{line}'"))?,
        })
    }
}

/// Appender for the shared audit file.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Checks that the file can be opened for appending and returns a handle.
    pub fn open(path: PathBuf) -> Result<Self> {
        open_append(&path)?;
        Ok(Self { path })
    }

    /// Empties the file, for a fresh run of a whole cluster.
    pub fn reset(path: PathBuf) -> Result<Self> {
        std::fs::write(&path, b"")
            .with_context(|| format!("failed to reset audit log {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut line = record.to_line();
        line.push('\n');
        let mut file = open_append(&self.path)?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", self.path.display()))
    }
}

fn open_append(path: &Path) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open audit log {}", path.display()))
}

/// Outcome of a successful [`verify`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuditSummary {
    /// Completed critical sections in log order.
    pub sections: Vec<(NodeId, u64, u64)>,
}

impl AuditSummary {
    pub fn count_for(&self, node: NodeId) -> usize {
        self.sections.iter().filter(|(n, _, _)| *n == node).count()
    }
}

/// Checks that critical sections in `records` never overlap.
///
/// Every `Entering` must be closed by a `Leaving` from the same node before
/// anyone else enters, and each section must start at a logical time later
/// than the previous section ended.
pub fn verify(records: &[AuditRecord]) -> Result<AuditSummary> {
    let mut summary = AuditSummary::default();
    let mut inside: Option<AuditRecord> = None;
    let mut last_exit: Option<AuditRecord> = None;

    for (index, record) in records.iter().enumerate() {
        let line = index + 1;
        match (record.action, inside) {
            (AuditAction::Entering, None) => {
                if let Some(exit) = last_exit {
                    ensure!(
                        record.timestamp > exit.timestamp,
                        "line {line}: node {} entered at {} but node {} only left at {}",
                        record.node,
                        record.timestamp,
                        exit.node,
                        exit.timestamp
                    );
                }
                inside = Some(*record);
            }
            (AuditAction::Entering, Some(holder)) => bail!(
                "line {line}: node {} entered while node {} was inside since {}",
                record.node,
                holder.node,
                holder.timestamp
            ),
            (AuditAction::Leaving, Some(holder)) if holder.node == record.node => {
                ensure!(
                    record.timestamp >= holder.timestamp,
                    "line {line}: node {} left at {} before entering at {}",
                    record.node,
                    record.timestamp,
                    holder.timestamp
                );
                summary
                    .sections
                    .push((record.node, holder.timestamp, record.timestamp));
                last_exit = Some(*record);
                inside = None;
            }
            (AuditAction::Leaving, _) => bail!(
                "line {line}: node {} left a critical section it did not hold",
                record.node
            ),
        }
    }

    if let Some(holder) = inside {
        bail!(
            "log ends with node {} inside the critical section",
            holder.node
        );
    }
    Ok(summary)
}

/// Reads and verifies an audit file.
pub fn verify_file(path: &Path) -> Result<AuditSummary> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read audit log {}", path.display()))?;
    let records = raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(AuditRecord::parse)
        .collect::<Result<Vec<_>>>()?;
    verify(&records)
}
