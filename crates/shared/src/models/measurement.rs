use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::node::NodeId;

/// Message sizes swept by the collective benchmark. Two measurements are only
/// comparable when they were taken with the same policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageSizePolicy {
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub step_factor: u32,
    pub iterations: u32,
}

impl Default for MessageSizePolicy {
    fn default() -> Self {
        const GIB: u64 = 1024 * 1024 * 1024;
        Self {
            min_bytes: GIB,
            max_bytes: GIB,
            step_factor: 2,
            iterations: 20,
        }
    }
}

/// Result of one benchmark invocation over one node group.
///
/// Measurements are never updated after they are recorded; testing the same
/// group again yields a new record with a new sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub sequence: u64,
    pub label: String,
    pub nodes: Vec<NodeId>,
    pub slots_per_node: u32,
    pub policy: MessageSizePolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_gb_s: Option<f64>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub elapsed_seconds: f64,
}

impl Measurement {
    /// Bandwidth of a successful measurement.
    pub fn bandwidth(&self) -> Option<f64> {
        if self.success {
            self.bandwidth_gb_s
        } else {
            None
        }
    }

    /// A failed measurement is never healthy, whatever the threshold.
    pub fn is_healthy(&self, threshold: &Threshold) -> bool {
        self.bandwidth().is_some_and(|bw| threshold.passes(bw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThresholdSource {
    Explicit,
    Calibrated { baseline_gb_s: f64, margin: f64 },
    /// No explicit value and no usable calibration baseline. Any successful
    /// measurement passes; only failures count against a group.
    Unavailable,
}

/// Bandwidth floor for a whole diagnosis run. Resolved once, then held fixed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub value_gb_s: f64,
    pub source: ThresholdSource,
}

impl Threshold {
    pub fn explicit(value_gb_s: f64) -> Self {
        Self {
            value_gb_s,
            source: ThresholdSource::Explicit,
        }
    }

    pub fn calibrated(baseline_gb_s: f64, margin: f64) -> Self {
        Self {
            value_gb_s: baseline_gb_s * margin,
            source: ThresholdSource::Calibrated {
                baseline_gb_s,
                margin,
            },
        }
    }

    pub fn unavailable() -> Self {
        Self {
            value_gb_s: 0.0,
            source: ThresholdSource::Unavailable,
        }
    }

    pub fn is_available(&self) -> bool {
        self.source != ThresholdSource::Unavailable
    }

    pub fn passes(&self, bandwidth_gb_s: f64) -> bool {
        !self.is_available() || bandwidth_gb_s >= self.value_gb_s
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            ThresholdSource::Explicit => write!(f, "{:.2} GB/s (explicit)", self.value_gb_s),
            ThresholdSource::Calibrated {
                baseline_gb_s,
                margin,
            } => write!(
                f,
                "{:.2} GB/s ({:.0}% of {baseline_gb_s:.2} GB/s baseline)",
                self.value_gb_s,
                margin * 100.0
            ),
            ThresholdSource::Unavailable => write!(f, "unavailable (failed measurements only)"),
        }
    }
}
