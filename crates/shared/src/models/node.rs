use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

/// Opaque identifier of a cluster node, usually a hostname or an IP address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeGroupError {
    Empty,
    DuplicateNode(NodeId),
    ZeroSlots,
}

impl fmt::Display for NodeGroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeGroupError::Empty => write!(f, "node group is empty"),
            NodeGroupError::DuplicateNode(node) => {
                write!(f, "node {node} appears more than once in the group")
            }
            NodeGroupError::ZeroSlots => write!(f, "slots per node must be at least 1"),
        }
    }
}

impl std::error::Error for NodeGroupError {}

/// Ordered set of distinct nodes benchmarked together, each contributing
/// `slots_per_node` accelerators to the collective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroup {
    nodes: Vec<NodeId>,
    slots_per_node: u32,
}

impl NodeGroup {
    pub fn new(nodes: Vec<NodeId>, slots_per_node: u32) -> Result<Self, NodeGroupError> {
        if nodes.is_empty() {
            return Err(NodeGroupError::Empty);
        }
        if slots_per_node == 0 {
            return Err(NodeGroupError::ZeroSlots);
        }
        let mut seen = HashSet::with_capacity(nodes.len());
        for node in &nodes {
            if !seen.insert(node) {
                return Err(NodeGroupError::DuplicateNode(node.clone()));
            }
        }
        Ok(Self {
            nodes,
            slots_per_node,
        })
    }

    pub fn single(node: NodeId, slots_per_node: u32) -> Self {
        Self {
            nodes: vec![node],
            slots_per_node: slots_per_node.max(1),
        }
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn slots_per_node(&self) -> u32 {
        self.slots_per_node
    }

    /// Total number of benchmark ranks the group launches.
    pub fn total_slots(&self) -> u64 {
        self.nodes.len() as u64 * u64::from(self.slots_per_node)
    }

    /// Order-insensitive identity of the group, used to detect repeated tests.
    pub fn member_set(&self) -> BTreeSet<NodeId> {
        self.nodes.iter().cloned().collect()
    }

    /// Splits into halves of `ceil(n/2)` and `floor(n/2)` nodes, preserving order.
    /// Returns `None` for single-node groups.
    pub fn split(&self) -> Option<(NodeGroup, NodeGroup)> {
        if self.nodes.len() < 2 {
            return None;
        }
        let mid = self.nodes.len().div_ceil(2);
        let (left, right) = self.nodes.split_at(mid);
        Some((
            NodeGroup {
                nodes: left.to_vec(),
                slots_per_node: self.slots_per_node,
            },
            NodeGroup {
                nodes: right.to_vec(),
                slots_per_node: self.slots_per_node,
            },
        ))
    }

    /// Two-node group of the members at positions `i` and `j`.
    pub fn pair_at(&self, i: usize, j: usize) -> Option<NodeGroup> {
        if i == j {
            return None;
        }
        Some(NodeGroup {
            nodes: vec![self.nodes.get(i)?.clone(), self.nodes.get(j)?.clone()],
            slots_per_node: self.slots_per_node,
        })
    }

    pub fn describe(&self) -> String {
        const SHOWN: usize = 3;
        let shown: Vec<&str> = self.nodes.iter().take(SHOWN).map(NodeId::as_str).collect();
        if self.nodes.len() > SHOWN {
            format!("[{}, ... +{}]", shown.join(", "), self.nodes.len() - SHOWN)
        } else {
            format!("[{}]", shown.join(", "))
        }
    }
}

/// One host line of an MPI hostfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub node: NodeId,
    pub slots: Option<u32>,
}

/// Parses an MPI hostfile (`host [slots=N]` per line, `#` comments).
///
/// Later occurrences of a host already listed are dropped so the inventory
/// stays a set.
pub fn parse_hostfile(content: &str) -> Vec<HostEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(host) = fields.next() else {
            continue;
        };
        if !seen.insert(host.to_string()) {
            log::warn!("Ignoring duplicate hostfile entry for {host}");
            continue;
        }
        let slots = fields
            .filter_map(|field| field.strip_prefix("slots="))
            .find_map(|value| value.parse::<u32>().ok());
        entries.push(HostEntry {
            node: NodeId::from(host),
            slots,
        });
    }
    entries
}

pub fn load_hostfile(path: &Path) -> anyhow::Result<Vec<HostEntry>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read hostfile {}: {e}", path.display()))?;
    Ok(parse_hostfile(&content))
}
