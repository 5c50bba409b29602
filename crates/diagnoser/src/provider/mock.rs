//! Deterministic stand-in for a cluster benchmark.
//!
//! A group's bandwidth is the bandwidth of its slowest member, which is how a
//! ring all-reduce behaves when one node's links are degraded.

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::models::{MessageSizePolicy, NodeGroup, NodeId};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::MeasurementProvider;
use crate::error::MeasurementError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockProfile {
    pub default_bandwidth_gb_s: f64,
    #[serde(default)]
    pub nodes: HashMap<NodeId, f64>,
    #[serde(default)]
    pub failing: Vec<NodeId>,
    #[serde(default)]
    pub always_timeout: bool,
    #[serde(default)]
    pub latency_ms: u64,
}

impl Default for MockProfile {
    fn default() -> Self {
        Self {
            default_bandwidth_gb_s: 100.0,
            nodes: HashMap::new(),
            failing: Vec::new(),
            always_timeout: false,
            latency_ms: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct MockProvider {
    profile: MockProfile,
    calls: AtomicUsize,
    measured: Mutex<Vec<Vec<NodeId>>>,
    active: Mutex<HashSet<NodeId>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    overlap_detected: AtomicBool,
}

impl MockProvider {
    pub fn from_profile(profile: MockProfile) -> Self {
        Self {
            profile,
            ..Default::default()
        }
    }

    pub fn uniform(bandwidth_gb_s: f64) -> Self {
        Self::from_profile(MockProfile {
            default_bandwidth_gb_s: bandwidth_gb_s,
            ..Default::default()
        })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read mock profile {}", path.display()))?;
        let profile: MockProfile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse mock profile {}", path.display()))?;
        Ok(Self::from_profile(profile))
    }

    pub fn with_node_bandwidth(mut self, node: impl Into<NodeId>, bandwidth_gb_s: f64) -> Self {
        self.profile.nodes.insert(node.into(), bandwidth_gb_s);
        self
    }

    pub fn with_failing_node(mut self, node: impl Into<NodeId>) -> Self {
        self.profile.failing.push(node.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.profile.latency_ms = latency.as_millis() as u64;
        self
    }

    pub fn always_timing_out(mut self) -> Self {
        self.profile.always_timeout = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn measured_groups(&self) -> Vec<Vec<NodeId>> {
        self.measured.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Whether two calls ever ran concurrently on a shared node.
    pub fn overlap_detected(&self) -> bool {
        self.overlap_detected.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn bandwidth_of(&self, group: &NodeGroup) -> Result<f64, MeasurementError> {
        if let Some(node) = group
            .nodes()
            .iter()
            .find(|node| self.profile.failing.contains(node))
        {
            return Err(MeasurementError::ProviderError(format!(
                "benchmark rank on {node} exited with an error"
            )));
        }
        Ok(group
            .nodes()
            .iter()
            .map(|node| {
                self.profile
                    .nodes
                    .get(node)
                    .copied()
                    .unwrap_or(self.profile.default_bandwidth_gb_s)
            })
            .fold(f64::INFINITY, f64::min))
    }
}

struct InFlight<'a> {
    provider: &'a MockProvider,
    nodes: Vec<NodeId>,
}

impl<'a> InFlight<'a> {
    fn enter(provider: &'a MockProvider, group: &NodeGroup) -> Self {
        if let Ok(mut active) = provider.active.lock() {
            for node in group.nodes() {
                if !active.insert(node.clone()) {
                    provider.overlap_detected.store(true, Ordering::SeqCst);
                }
            }
        }
        let now = provider.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        provider.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self {
            provider,
            nodes: group.nodes().to_vec(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.provider.active.lock() {
            for node in &self.nodes {
                active.remove(node);
            }
        }
        self.provider.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MeasurementProvider for MockProvider {
    async fn measure(
        &self,
        group: &NodeGroup,
        _policy: &MessageSizePolicy,
    ) -> Result<f64, MeasurementError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut measured) = self.measured.lock() {
            measured.push(group.nodes().to_vec());
        }
        let _guard = InFlight::enter(self, group);

        let latency = Duration::from_millis(self.profile.latency_ms);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.profile.always_timeout {
            return Err(MeasurementError::ProviderTimeout(latency));
        }
        self.bandwidth_of(group)
    }
}
