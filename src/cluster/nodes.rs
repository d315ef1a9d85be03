//! `CLUSTER NODES` output parsing and the slot-to-node map.
//!
//! The tool keeps its own picture of which master serves which hash
//! slot so a pipelined batch can be pointed at the right node up front
//! and re-pointed after a `MOVED` redirect.

use std::fmt;

use thiserror::Error;

/// Errors that can occur when parsing cluster topology output.
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("invalid cluster nodes line: {0}")]
    InvalidNodeLine(String),

    #[error("invalid slot range: {0}")]
    InvalidSlotRange(String),
}

/// An inclusive range of hash slots owned by one master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, slot: u16) -> bool {
        self.start <= slot && slot <= self.end
    }

    /// Parse `0-5460` or a single `5461`. Slots in `[...]`
    /// importing/migrating markers are reported as errors and skipped
    /// by the caller; the owner listed in the plain ranges still
    /// answers for them until migration completes.
    pub fn parse(s: &str) -> Result<Self, TopologyError> {
        let s = s.trim();
        if s.starts_with('[') {
            return Err(TopologyError::InvalidSlotRange(format!(
                "slot in migration: {s}"
            )));
        }
        if let Some((start_text, end_text)) = s.split_once('-') {
            let start = start_text
                .parse()
                .map_err(|_| TopologyError::InvalidSlotRange(s.to_string()))?;
            let end = end_text
                .parse()
                .map_err(|_| TopologyError::InvalidSlotRange(s.to_string()))?;
            Ok(Self::new(start, end))
        } else {
            let slot = s
                .parse()
                .map_err(|_| TopologyError::InvalidSlotRange(s.to_string()))?;
            Ok(Self::new(slot, slot))
        }
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// One node from `CLUSTER NODES` output, trimmed to what batch routing
/// needs.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    /// Unique node id (40 hex characters).
    pub id: String,
    pub host: String,
    pub port: u16,
    pub master: bool,
    /// Failing or handshaking nodes are skipped when routing.
    pub healthy: bool,
    pub connected: bool,
    /// Slot ranges owned by this node (masters only).
    pub slots: Vec<SlotRange>,
}

impl ClusterNode {
    /// Parse a single `CLUSTER NODES` line:
    /// `<id> <ip:port@cport> <flags> <master> <ping> <pong> <epoch> <link-state> <slot>...`
    pub fn parse_line(line: &str) -> Result<Self, TopologyError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 8 {
            return Err(TopologyError::InvalidNodeLine(format!(
                "not enough fields in line: {line}"
            )));
        }

        let id = parts[0].to_string();

        // Address is ip:port@cport; the cluster bus port is irrelevant here.
        let host_port = parts[1].split('@').next().unwrap_or(parts[1]);
        let (host, port_text) = host_port.rsplit_once(':').ok_or_else(|| {
            TopologyError::InvalidNodeLine(format!("invalid address: {host_port}"))
        })?;
        let port = port_text
            .parse()
            .map_err(|_| TopologyError::InvalidNodeLine(format!("invalid port: {port_text}")))?;

        let mut master = false;
        let mut healthy = true;
        for flag in parts[2].split(',') {
            match flag {
                "master" => master = true,
                "fail" | "pfail" | "handshake" | "noaddr" => healthy = false,
                _ => {}
            }
        }

        let connected = parts[7] == "connected";

        let slots = parts[8..]
            .iter()
            .filter_map(|s| SlotRange::parse(s).ok())
            .collect();

        Ok(Self {
            id,
            host: host.trim_matches(['[', ']']).to_string(),
            port,
            master,
            healthy,
            connected,
            slots,
        })
    }

    fn serves(&self, slot: u16) -> bool {
        self.master && self.slots.iter().any(|range| range.contains(slot))
    }
}

/// The parsed cluster topology: every known node and its slots.
#[derive(Debug, Clone, Default)]
pub struct ClusterMap {
    pub nodes: Vec<ClusterNode>,
}

impl ClusterMap {
    /// Parse the full output of `CLUSTER NODES`.
    pub fn parse(output: &str) -> Result<Self, TopologyError> {
        let nodes = output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(ClusterNode::parse_line)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { nodes })
    }

    /// The healthy master serving `slot`, if any.
    pub fn owner_of(&self, slot: u16) -> Option<&ClusterNode> {
        self.nodes
            .iter()
            .find(|n| n.serves(slot) && n.healthy && n.connected)
    }
}
