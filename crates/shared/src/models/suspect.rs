use serde::{Deserialize, Serialize};
use std::fmt;

use super::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMethod {
    Bisection,
    PairwiseOutlier,
    Zscore,
    Iqr,
    SingleNode,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionMethod::Bisection => write!(f, "bisection"),
            DetectionMethod::PairwiseOutlier => write!(f, "pairwise-outlier"),
            DetectionMethod::Zscore => write!(f, "zscore"),
            DetectionMethod::Iqr => write!(f, "iqr"),
            DetectionMethod::SingleNode => write!(f, "single-node"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Low => write!(f, "low"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::High => write!(f, "high"),
        }
    }
}

/// Evidence backing a suspect; which fields are set depends on the method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuspectStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measured_bandwidth_gb_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_bandwidth_gb_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_bandwidth_gb_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairs_observed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspectRecord {
    pub node: NodeId,
    pub method: DetectionMethod,
    pub confidence: Confidence,
    pub reason: String,
    #[serde(default)]
    pub stats: SuspectStats,
}

impl SuspectRecord {
    pub fn new(
        node: NodeId,
        method: DetectionMethod,
        confidence: Confidence,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            node,
            method,
            confidence,
            reason: reason.into(),
            stats: SuspectStats::default(),
        }
    }

    pub fn with_stats(mut self, stats: SuspectStats) -> Self {
        self.stats = stats;
        self
    }
}
