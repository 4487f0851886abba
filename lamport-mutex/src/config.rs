//! Static cluster configuration: the peer directory and timing settings.
//!
//! The configuration is a JSON file loaded once at startup and shared,
//! unchanged, by every node of the roster:
//!
//! ```json
//! {
//!   "nodes": [
//!     { "id": 1, "addr": "127.0.0.1:7101", "clock": 0 },
//!     { "id": 2, "addr": "127.0.0.1:7102", "clock": 3 }
//!   ],
//!   "settings": { "quota": 5 },
//!   "log_dir": "logs"
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use serde::{Deserialize, Serialize};

use crate::message::NodeId;

/// One member of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// Initial value of this node's logical clock.
    #[serde(default)]
    pub clock: u64,
}

/// Timing and workload knobs. Every field has a default, so the
/// `settings` object may be omitted or partial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeSettings {
    /// Critical-section entries after which a node stops generating work.
    pub quota: u32,
    /// Chance, out of 100, that an event is application traffic.
    pub application_percent: u32,
    /// Delay between two events, in milliseconds.
    pub event_delay_ms: (u64, u64),
    /// Time spent inside the critical section, in milliseconds.
    pub critical_section_ms: (u64, u64),
    /// Pause before the first event so the rest of the roster can start.
    pub startup_delay_ms: u64,
    /// Wait between two rounds of the startup connectivity check.
    pub connect_backoff_ms: u64,
    /// Seed for the event generator; random when absent.
    pub seed: Option<u64>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            quota: 5,
            application_percent: 90,
            event_delay_ms: (1000, 5000),
            critical_section_ms: (1000, 2000),
            startup_delay_ms: 8000,
            connect_backoff_ms: 1000,
            seed: None,
        }
    }
}

impl NodeSettings {
    pub fn event_delay(&self) -> RangeInclusive<u64> {
        ordered_range(self.event_delay_ms)
    }

    pub fn critical_section(&self) -> RangeInclusive<u64> {
        ordered_range(self.critical_section_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.application_percent <= 100,
            "application_percent must be at most 100, got {}",
            self.application_percent
        );
        Ok(())
    }
}

fn ordered_range((a, b): (u64, u64)) -> RangeInclusive<u64> {
    a.min(b)..=a.max(b)
}

/// Immutable `node id -> address` lookup for the whole roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDirectory {
    entries: BTreeMap<NodeId, PeerEntry>,
}

impl PeerDirectory {
    pub fn new(entries: Vec<PeerEntry>) -> Result<Self> {
        ensure!(!entries.is_empty(), "peer directory requires at least one node");
        let mut seen = HashSet::new();
        let mut addrs = HashSet::new();
        for entry in &entries {
            ensure!(seen.insert(entry.id), "duplicate node id {}", entry.id);
            ensure!(
                addrs.insert(entry.addr),
                "address {} is assigned to more than one node",
                entry.addr
            );
        }
        Ok(Self {
            entries: entries.into_iter().map(|e| (e.id, e)).collect(),
        })
    }

    pub fn addr(&self, id: NodeId) -> Option<SocketAddr> {
        self.entries.get(&id).map(|e| e.addr)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.entries.contains_key(&id)
    }

    /// All node ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.keys().copied()
    }

    /// Every member except `id`, in ascending order.
    pub fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
        self.ids().filter(|&other| other != id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The parsed configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<PeerEntry>,
    #[serde(default)]
    pub settings: NodeSettings,
    /// Directory for the per-node metrics logs and the shared audit log.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("malformed config JSON")?;
        config.settings.validate()?;
        // Validation runs once here so later lookups can assume a sane roster.
        config.directory()?;
        Ok(config)
    }

    pub fn directory(&self) -> Result<PeerDirectory> {
        PeerDirectory::new(self.nodes.clone())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Initial clock value for `id`.
    pub fn clock_seed(&self, id: NodeId) -> Result<u64> {
        self.nodes
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.clock)
            .ok_or_else(|| anyhow!("node id {id} missing from peer directory"))
    }
}
