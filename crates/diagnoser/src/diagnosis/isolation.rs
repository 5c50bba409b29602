use log::{info, warn};
use shared::models::{
    DetectionMethod, DiagnosisReport, IsolationDecision, IsolationEntry, NodeId, SuspectRecord,
};
use std::collections::{BTreeSet, HashMap};

use crate::error::{DiagnosisError, Result};

struct Merged {
    entry: IsolationEntry,
    methods: BTreeSet<DetectionMethod>,
    reasons: Vec<String>,
}

/// Collapses suspect records into one entry per node, keeping the highest
/// confidence and every contributing method. Entries follow `inventory`
/// order; suspects for nodes outside the inventory are dropped.
pub fn merge_suspects(inventory: &[NodeId], suspects: &[SuspectRecord]) -> Vec<IsolationEntry> {
    let mut merged: HashMap<&NodeId, Merged> = HashMap::new();
    for suspect in suspects {
        if !inventory.contains(&suspect.node) {
            warn!("Ignoring suspect {} which is not in the node set", suspect.node);
            continue;
        }
        let slot = merged.entry(&suspect.node).or_insert_with(|| Merged {
            entry: IsolationEntry {
                node: suspect.node.clone(),
                confidence: suspect.confidence,
                methods: Vec::new(),
                reason: String::new(),
            },
            methods: BTreeSet::new(),
            reasons: Vec::new(),
        });
        slot.entry.confidence = slot.entry.confidence.max(suspect.confidence);
        slot.methods.insert(suspect.method);
        let reason = format!("{}: {}", suspect.method, suspect.reason);
        if !slot.reasons.contains(&reason) {
            slot.reasons.push(reason);
        }
    }

    inventory
        .iter()
        .filter_map(|node| merged.remove(node))
        .map(|m| IsolationEntry {
            methods: m.methods.into_iter().collect(),
            reason: m.reasons.join("; "),
            ..m.entry
        })
        .collect()
}

/// Turns a finished report into the exclusion decision downstream tools consume.
///
/// Contains no wall-clock data, so building twice from the same report gives
/// byte-identical output. An empty bad list is a valid decision.
pub fn build(report: &DiagnosisReport) -> Result<IsolationDecision> {
    if report.nodes.is_empty() {
        return Err(DiagnosisError::EmptyGroup);
    }

    let bad = merge_suspects(&report.nodes, &report.suspects);
    let bad_set: BTreeSet<&NodeId> = bad.iter().map(|entry| &entry.node).collect();
    let good: Vec<NodeId> = report
        .nodes
        .iter()
        .filter(|node| !bad_set.contains(node))
        .cloned()
        .collect();

    info!(
        "Isolation decision for run {}: {} bad, {} good",
        report.run_id,
        bad.len(),
        good.len()
    );
    Ok(IsolationDecision {
        run_id: report.run_id.clone(),
        threshold_gb_s: report.threshold.value_gb_s,
        bad,
        good,
    })
}
