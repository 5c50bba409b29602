use shared::models::{Measurement, MessageSizePolicy, NodeGroup, NodeId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Identity of a test: which nodes, how many ranks each, which message sizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestKey {
    members: BTreeSet<NodeId>,
    slots_per_node: u32,
    policy: MessageSizePolicy,
}

impl TestKey {
    pub fn new(group: &NodeGroup, policy: &MessageSizePolicy) -> Self {
        Self {
            members: group.member_set(),
            slots_per_node: group.slots_per_node(),
            policy: *policy,
        }
    }

    fn matches(&self, measurement: &Measurement) -> bool {
        measurement.slots_per_node == self.slots_per_node
            && measurement.policy == self.policy
            && measurement.nodes.len() == self.members.len()
            && measurement.nodes.iter().all(|n| self.members.contains(n))
    }
}

/// Append-only log of every measurement taken during one run.
#[derive(Debug, Clone, Default)]
pub struct MeasurementHistory {
    entries: Arc<Mutex<Vec<Measurement>>>,
}

impl MeasurementHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `measurement`, assigning it the next sequence number.
    pub async fn record(&self, mut measurement: Measurement) -> Measurement {
        let mut entries = self.entries.lock().await;
        measurement.sequence = entries.len() as u64;
        entries.push(measurement.clone());
        measurement
    }

    /// Earliest measurement of an identical test, if any.
    pub async fn lookup(&self, key: &TestKey) -> Option<Measurement> {
        let entries = self.entries.lock().await;
        entries.iter().find(|m| key.matches(m)).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<Measurement> {
        self.entries.lock().await.clone()
    }
}
