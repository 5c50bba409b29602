use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::measurement::{Measurement, Threshold};
use super::node::NodeId;
use super::suspect::{Confidence, DetectionMethod, SuspectRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMode {
    #[default]
    Bisection,
    Pairwise,
    Both,
    LegacyStatistical,
}

impl DetectionMode {
    pub fn runs_bisection(&self) -> bool {
        matches!(self, DetectionMode::Bisection | DetectionMode::Both)
    }

    pub fn runs_pairwise(&self) -> bool {
        matches!(self, DetectionMode::Pairwise | DetectionMode::Both)
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionMode::Bisection => write!(f, "bisection"),
            DetectionMode::Pairwise => write!(f, "pairwise"),
            DetectionMode::Both => write!(f, "both"),
            DetectionMode::LegacyStatistical => write!(f, "legacy-statistical"),
        }
    }
}

impl FromStr for DetectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bisection" => Ok(DetectionMode::Bisection),
            "pairwise" => Ok(DetectionMode::Pairwise),
            "both" => Ok(DetectionMode::Both),
            "legacy-statistical" | "legacy" | "statistical" => {
                Ok(DetectionMode::LegacyStatistical)
            }
            other => Err(format!(
                "unknown detection mode '{other}' (expected bisection, pairwise, both or legacy-statistical)"
            )),
        }
    }
}

/// Permanent record of one diagnosis run. Built once when the run finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub mode: DetectionMode,
    pub total_nodes: usize,
    pub total_tests: usize,
    pub duration_seconds: f64,
    pub threshold: Threshold,
    /// Full inventory in the order it was supplied.
    pub nodes: Vec<NodeId>,
    pub bad_nodes: Vec<NodeId>,
    pub good_nodes: Vec<NodeId>,
    /// Nodes left undecided because the run was cancelled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_nodes: Vec<NodeId>,
    #[serde(default)]
    pub cancelled: bool,
    pub suspects: Vec<SuspectRecord>,
    pub measurements: Vec<Measurement>,
}

impl DiagnosisReport {
    pub fn has_bad_nodes(&self) -> bool {
        !self.bad_nodes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationEntry {
    pub node: NodeId,
    pub confidence: Confidence,
    pub methods: Vec<DetectionMethod>,
    pub reason: String,
}

/// What downstream exclusion-list generators consume: bad nodes with a
/// confidence and reason each, and the remaining good nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationDecision {
    pub run_id: String,
    pub threshold_gb_s: f64,
    pub bad: Vec<IsolationEntry>,
    pub good: Vec<NodeId>,
}

impl IsolationDecision {
    pub fn is_clean(&self) -> bool {
        self.bad.is_empty()
    }

    pub fn bad_node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.bad.iter().map(|entry| &entry.node)
    }
}
