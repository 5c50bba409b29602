use log::{debug, info};
use shared::models::{
    Confidence, DetectionMethod, Measurement, NodeGroup, NodeId, SuspectRecord, SuspectStats,
    Threshold,
};
use tokio_util::sync::CancellationToken;

use super::measure::{failure_reason, MeasurementRunner};
use crate::config::BisectionStrategy;

pub const BISECTION_LABEL: &str = "bisection";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BisectionOutcome {
    pub suspects: Vec<SuspectRecord>,
    /// Nodes whose group was never tested because the run was cancelled.
    pub unresolved: Vec<NodeId>,
    pub cancelled: bool,
}

/// Localises low-bandwidth nodes by halving failing groups.
///
/// Healthy groups are never subdivided. Failing groups are split in order into
/// halves of `ceil(n/2)` and `floor(n/2)` nodes. Pending groups live on an
/// explicit stack; up to `parallelism` of them are measured at once, which is
/// safe because pending groups never share a node.
pub struct BisectionDiagnoser {
    runner: MeasurementRunner,
    strategy: BisectionStrategy,
    parallelism: usize,
    cancel: CancellationToken,
}

impl BisectionDiagnoser {
    pub fn new(
        runner: MeasurementRunner,
        strategy: BisectionStrategy,
        parallelism: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            strategy,
            parallelism: parallelism.max(1),
            cancel,
        }
    }

    pub async fn diagnose(&self, group: NodeGroup, threshold: &Threshold) -> BisectionOutcome {
        info!(
            "Bisecting {} node(s) with {} strategy against {threshold}",
            group.len(),
            self.strategy
        );
        let mut outcome = match self.strategy {
            BisectionStrategy::Exhaustive => self.exhaustive(group.clone(), threshold).await,
            BisectionStrategy::BinarySearch => self.binary_search(group.clone(), threshold).await,
        };

        // Execution order depends on scheduling; report in inventory order.
        let position = |node: &NodeId| group.nodes().iter().position(|n| n == node);
        outcome.suspects.sort_by_key(|s| position(&s.node));
        outcome.unresolved.sort_by_key(position);
        info!(
            "Bisection finished: {} suspect(s), {} unresolved",
            outcome.suspects.len(),
            outcome.unresolved.len()
        );
        outcome
    }

    async fn exhaustive(&self, root: NodeGroup, threshold: &Threshold) -> BisectionOutcome {
        let mut outcome = BisectionOutcome::default();
        let mut pending = vec![root];

        while !pending.is_empty() {
            if self.cancel.is_cancelled() {
                info!("Bisection cancelled with {} group(s) pending", pending.len());
                outcome.cancelled = true;
                for group in pending.drain(..) {
                    outcome.unresolved.extend(group.nodes().iter().cloned());
                }
                break;
            }

            let wave_size = self.parallelism.min(pending.len());
            let wave = pending.split_off(pending.len() - wave_size);
            for (group, measurement) in self.runner.measure_all(wave, BISECTION_LABEL).await {
                if measurement.is_healthy(threshold) {
                    continue;
                }
                match group.split() {
                    None => outcome
                        .suspects
                        .push(measured_suspect(&group, &measurement, threshold)),
                    Some((left, right)) => {
                        debug!(
                            "{} failed, splitting into {} and {}",
                            group.describe(),
                            left.describe(),
                            right.describe()
                        );
                        // Left on top so the search goes depth-first, left to right.
                        pending.push(right);
                        pending.push(left);
                    }
                }
            }
        }
        outcome
    }

    async fn binary_search(&self, root: NodeGroup, threshold: &Threshold) -> BisectionOutcome {
        let mut outcome = BisectionOutcome::default();
        if self.cancel.is_cancelled() {
            outcome.cancelled = true;
            outcome.unresolved = root.nodes().to_vec();
            return outcome;
        }

        let root_measurement = self.runner.measure(&root, BISECTION_LABEL).await;
        if root_measurement.is_healthy(threshold) {
            return outcome;
        }

        let mut current = root;
        let mut evidence = Evidence::Measured(root_measurement);
        loop {
            let Some((left, right)) = current.split() else {
                outcome.suspects.push(match &evidence {
                    Evidence::Measured(measurement) => {
                        measured_suspect(&current, measurement, threshold)
                    }
                    Evidence::Inferred { parent, sibling } => {
                        inferred_suspect(&current, parent, sibling)
                    }
                });
                break;
            };

            if self.cancel.is_cancelled() {
                info!("Bisection cancelled while narrowing {}", current.describe());
                outcome.cancelled = true;
                outcome.unresolved = current.nodes().to_vec();
                break;
            }

            let left_measurement = self.runner.measure(&left, BISECTION_LABEL).await;
            if left_measurement.is_healthy(threshold) {
                debug!(
                    "{} passed, fault must be in {}",
                    left.describe(),
                    right.describe()
                );
                evidence = Evidence::Inferred {
                    parent: current,
                    sibling: left,
                };
                current = right;
            } else {
                debug!("{} failed, narrowing into it", left.describe());
                evidence = Evidence::Measured(left_measurement);
                current = left;
            }
        }
        outcome
    }
}

/// Why the group currently being narrowed is known to fail.
enum Evidence {
    Measured(Measurement),
    /// The parent failed while the sibling half passed.
    Inferred { parent: NodeGroup, sibling: NodeGroup },
}

fn measured_suspect(
    group: &NodeGroup,
    measurement: &Measurement,
    threshold: &Threshold,
) -> SuspectRecord {
    let node = group.nodes()[0].clone();
    let confidence = if measurement.bandwidth().is_some() {
        Confidence::High
    } else {
        Confidence::Medium
    };
    SuspectRecord::new(
        node,
        DetectionMethod::Bisection,
        confidence,
        failure_reason(measurement, threshold),
    )
    .with_stats(SuspectStats {
        measured_bandwidth_gb_s: measurement.bandwidth(),
        ..Default::default()
    })
}

fn inferred_suspect(group: &NodeGroup, parent: &NodeGroup, sibling: &NodeGroup) -> SuspectRecord {
    SuspectRecord::new(
        group.nodes()[0].clone(),
        DetectionMethod::Bisection,
        Confidence::Medium,
        format!(
            "inferred: {} failed while {} passed",
            parent.describe(),
            sibling.describe()
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::history::MeasurementHistory;
    use crate::provider::MockProvider;
    use shared::models::MessageSizePolicy;
    use std::sync::Arc;
    use std::time::Duration;

    const BASELINE: f64 = 100.0;

    fn threshold() -> Threshold {
        Threshold::explicit(BASELINE * 0.85)
    }

    fn cluster(n: usize) -> NodeGroup {
        NodeGroup::new((0..n).map(|i| NodeId::from(format!("n{i}"))).collect(), 8).unwrap()
    }

    fn diagnoser(
        provider: &Arc<MockProvider>,
        strategy: BisectionStrategy,
        parallelism: usize,
    ) -> BisectionDiagnoser {
        let runner = MeasurementRunner::new(
            provider.clone(),
            MeasurementHistory::new(),
            MessageSizePolicy::default(),
            Duration::from_secs(5),
        );
        BisectionDiagnoser::new(runner, strategy, parallelism, CancellationToken::new())
    }

    fn ceil_log2(n: usize) -> usize {
        (usize::BITS - (n - 1).leading_zeros()) as usize
    }

    fn suspect_names(outcome: &BisectionOutcome) -> Vec<&str> {
        outcome.suspects.iter().map(|s| s.node.as_str()).collect()
    }

    #[tokio::test]
    async fn test_healthy_group_takes_one_measurement() {
        for strategy in [BisectionStrategy::Exhaustive, BisectionStrategy::BinarySearch] {
            let provider = Arc::new(MockProvider::uniform(BASELINE));
            let outcome = diagnoser(&provider, strategy, 1)
                .diagnose(cluster(16), &threshold())
                .await;
            assert!(outcome.suspects.is_empty());
            assert_eq!(provider.calls(), 1);
        }
    }

    #[tokio::test]
    async fn test_finds_single_slow_node_among_eight() {
        let provider = Arc::new(MockProvider::uniform(BASELINE).with_node_bandwidth("n7", 60.0));
        let outcome = diagnoser(&provider, BisectionStrategy::Exhaustive, 1)
            .diagnose(cluster(8), &threshold())
            .await;

        assert_eq!(suspect_names(&outcome), vec!["n7"]);
        let suspect = &outcome.suspects[0];
        assert_eq!(suspect.method, DetectionMethod::Bisection);
        assert_eq!(suspect.confidence, Confidence::High);
        assert_eq!(suspect.stats.measured_bandwidth_gb_s, Some(60.0));
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn test_binary_search_bound_for_every_position() {
        for n in [8, 13] {
            for bad in 0..n {
                let name = format!("n{bad}");
                let provider =
                    Arc::new(MockProvider::uniform(BASELINE).with_node_bandwidth(name.as_str(), 50.0));
                let outcome = diagnoser(&provider, BisectionStrategy::BinarySearch, 1)
                    .diagnose(cluster(n), &threshold())
                    .await;

                assert_eq!(suspect_names(&outcome), vec![name.as_str()], "n={n}");
                assert!(
                    provider.calls() <= ceil_log2(n) + 1,
                    "n={n} bad={bad} took {} measurements",
                    provider.calls()
                );
            }
        }
    }

    #[tokio::test]
    async fn test_exhaustive_bound_for_every_position() {
        for n in [8, 13] {
            for bad in 0..n {
                let name = format!("n{bad}");
                let provider =
                    Arc::new(MockProvider::uniform(BASELINE).with_node_bandwidth(name.as_str(), 50.0));
                let outcome = diagnoser(&provider, BisectionStrategy::Exhaustive, 1)
                    .diagnose(cluster(n), &threshold())
                    .await;

                assert_eq!(suspect_names(&outcome), vec![name.as_str()]);
                assert!(provider.calls() <= 2 * ceil_log2(n) + 1);
            }
        }
    }

    #[tokio::test]
    async fn test_exhaustive_finds_every_bad_node() {
        let provider = Arc::new(
            MockProvider::uniform(BASELINE)
                .with_node_bandwidth("n2", 40.0)
                .with_node_bandwidth("n9", 70.0),
        );
        let outcome = diagnoser(&provider, BisectionStrategy::Exhaustive, 1)
            .diagnose(cluster(12), &threshold())
            .await;
        assert_eq!(suspect_names(&outcome), vec!["n2", "n9"]);
    }

    #[tokio::test]
    async fn test_parallel_waves_match_sequential_tests() {
        let make = || {
            Arc::new(
                MockProvider::uniform(BASELINE)
                    .with_node_bandwidth("n1", 40.0)
                    .with_node_bandwidth("n6", 40.0)
                    .with_node_bandwidth("n12", 40.0)
                    .with_latency(Duration::from_millis(5)),
            )
        };
        let sequential = make();
        let parallel = make();

        let a = diagnoser(&sequential, BisectionStrategy::Exhaustive, 1)
            .diagnose(cluster(16), &threshold())
            .await;
        let b = diagnoser(&parallel, BisectionStrategy::Exhaustive, 4)
            .diagnose(cluster(16), &threshold())
            .await;

        assert_eq!(a, b);
        assert_eq!(sequential.calls(), parallel.calls());
        let mut tested_a = sequential.measured_groups();
        let mut tested_b = parallel.measured_groups();
        tested_a.sort();
        tested_b.sort();
        assert_eq!(tested_a, tested_b);
        assert!(parallel.peak_concurrency() > 1);
        assert!(!parallel.overlap_detected());
    }

    #[tokio::test]
    async fn test_failed_measurements_force_subdivision() {
        let provider = Arc::new(MockProvider::uniform(BASELINE).always_timing_out());
        let outcome = diagnoser(&provider, BisectionStrategy::Exhaustive, 2)
            .diagnose(cluster(4), &threshold())
            .await;

        assert_eq!(suspect_names(&outcome), vec!["n0", "n1", "n2", "n3"]);
        for suspect in &outcome.suspects {
            assert!(suspect.reason.starts_with("measurement failed"));
            assert_eq!(suspect.confidence, Confidence::Medium);
        }
        // 1 root + 2 halves + 4 singles
        assert_eq!(provider.calls(), 7);
    }

    #[tokio::test]
    async fn test_binary_search_infers_last_node() {
        let provider = Arc::new(MockProvider::uniform(BASELINE).with_node_bandwidth("n1", 50.0));
        let outcome = diagnoser(&provider, BisectionStrategy::BinarySearch, 1)
            .diagnose(cluster(2), &threshold())
            .await;

        assert_eq!(suspect_names(&outcome), vec!["n1"]);
        assert_eq!(outcome.suspects[0].confidence, Confidence::Medium);
        assert!(outcome.suspects[0].reason.starts_with("inferred"));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_nodes_unresolved() {
        let provider = Arc::new(MockProvider::uniform(BASELINE).with_node_bandwidth("n3", 10.0));
        let runner = MeasurementRunner::new(
            provider.clone(),
            MeasurementHistory::new(),
            MessageSizePolicy::default(),
            Duration::from_secs(5),
        );
        let token = CancellationToken::new();
        token.cancel();
        let outcome = BisectionDiagnoser::new(runner, BisectionStrategy::Exhaustive, 1, token)
            .diagnose(cluster(4), &threshold())
            .await;

        assert!(outcome.cancelled);
        assert!(outcome.suspects.is_empty());
        assert_eq!(outcome.unresolved.len(), 4);
        assert_eq!(provider.calls(), 0);
    }
}
