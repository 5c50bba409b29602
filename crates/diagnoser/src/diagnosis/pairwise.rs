use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shared::models::{
    Confidence, DetectionMethod, NodeGroup, NodeId, SuspectRecord, SuspectStats, Threshold,
};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

use super::measure::MeasurementRunner;
use super::statistics::{self, OutlierConfig};
use crate::config::DiagnosisConfig;

pub const PAIR_LABEL: &str = "pair";

/// Index pair into the node list, `.0 < .1`.
pub type PairIndex = (usize, usize);

/// Chooses which two-node combinations to measure.
///
/// Every combination is returned when it fits under `max_pairs`. Otherwise a
/// coverage pass first pairs neighbours `(0,1), (2,3), ...` (wrapping the last
/// node of an odd set onto node 0) so each node is tested at least once, and
/// the remaining budget is filled from a shuffle of the other combinations.
/// The result is sorted.
pub fn plan_pairs(node_count: usize, max_pairs: Option<usize>, seed: Option<u64>) -> Vec<PairIndex> {
    let all: Vec<PairIndex> = (0..node_count)
        .flat_map(|i| (i + 1..node_count).map(move |j| (i, j)))
        .collect();
    let cap = match max_pairs {
        Some(cap) if cap < all.len() => cap,
        _ => return all,
    };

    let mut coverage: Vec<PairIndex> = (0..node_count / 2).map(|k| (2 * k, 2 * k + 1)).collect();
    if node_count % 2 == 1 && node_count > 1 {
        coverage.push((0, node_count - 1));
    }
    if cap < coverage.len() {
        warn!(
            "max_pairs={cap} cannot cover all {node_count} nodes (needs {}); some nodes will not be tested",
            coverage.len()
        );
        coverage.truncate(cap);
        coverage.sort_unstable();
        return coverage;
    }

    let covered: BTreeSet<PairIndex> = coverage.iter().copied().collect();
    let mut rest: Vec<PairIndex> = all.into_iter().filter(|p| !covered.contains(p)).collect();
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    rest.shuffle(&mut rng);

    let mut planned = coverage;
    planned.extend(rest.into_iter().take(cap - planned.len()));
    planned.sort_unstable();
    planned
}

/// Packs pairs into rounds of at most `parallelism` node-disjoint pairs, in
/// order, so no node runs two benchmarks at once.
pub fn schedule_rounds(pairs: &[PairIndex], parallelism: usize) -> Vec<Vec<PairIndex>> {
    let parallelism = parallelism.max(1);
    let mut remaining: Vec<PairIndex> = pairs.to_vec();
    let mut rounds = Vec::new();
    while !remaining.is_empty() {
        let mut busy = BTreeSet::new();
        let mut round = Vec::new();
        remaining.retain(|&(a, b)| {
            if round.len() < parallelism && !busy.contains(&a) && !busy.contains(&b) {
                busy.insert(a);
                busy.insert(b);
                round.push((a, b));
                false
            } else {
                true
            }
        });
        rounds.push(round);
    }
    rounds
}

/// Aggregated pair results for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodePairStats {
    pub node: NodeId,
    pub pairs_observed: u32,
    /// Pairs that failed or measured below the threshold.
    pub failure_count: u32,
    pub failure_rate: f64,
    /// Over successful pairs only; `None` when every pair failed.
    pub average_bandwidth_gb_s: Option<f64>,
    pub std_bandwidth_gb_s: Option<f64>,
}

impl NodePairStats {
    fn confidence(&self) -> Confidence {
        match self.pairs_observed {
            0 | 1 => Confidence::Low,
            2 | 3 => Confidence::Medium,
            _ => Confidence::High,
        }
    }

    fn suspect_stats(&self) -> SuspectStats {
        SuspectStats {
            average_bandwidth_gb_s: self.average_bandwidth_gb_s,
            std_bandwidth_gb_s: self.std_bandwidth_gb_s,
            pairs_observed: Some(self.pairs_observed),
            failure_count: Some(self.failure_count),
            failure_rate: Some(self.failure_rate),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairwiseOutcome {
    pub suspects: Vec<SuspectRecord>,
    /// Nodes with at least one observed pair, in inventory order.
    pub node_stats: Vec<NodePairStats>,
    pub pairs_planned: usize,
    pub pairs_measured: usize,
    /// Nodes left without any observed pair because the run was cancelled.
    pub unresolved: Vec<NodeId>,
    pub cancelled: bool,
}

#[derive(Default)]
struct Tally {
    observed: u32,
    failures: u32,
    bandwidths: Vec<f64>,
}

/// Flags nodes that underperform across many partners.
pub struct PairwiseValidator {
    runner: MeasurementRunner,
    max_pairs: Option<usize>,
    seed: Option<u64>,
    failure_rate_threshold: f64,
    parallelism: usize,
    outliers: OutlierConfig,
    cancel: CancellationToken,
}

impl PairwiseValidator {
    pub fn new(runner: MeasurementRunner, config: &DiagnosisConfig, cancel: CancellationToken) -> Self {
        Self {
            runner,
            max_pairs: config.max_pairs,
            seed: config.pair_seed,
            failure_rate_threshold: config.failure_rate_threshold,
            parallelism: config.parallelism.max(1),
            outliers: OutlierConfig {
                low_side_only: true,
                ..OutlierConfig::from(config)
            },
            cancel,
        }
    }

    pub async fn cross_validate(&self, group: &NodeGroup, threshold: &Threshold) -> PairwiseOutcome {
        let nodes = group.nodes();
        if nodes.len() < 2 {
            warn!("Pairwise validation needs at least 2 nodes, got {}", nodes.len());
            return PairwiseOutcome::default();
        }

        let pairs = plan_pairs(nodes.len(), self.max_pairs, self.seed);
        let rounds = schedule_rounds(&pairs, self.parallelism);
        info!(
            "Pairwise validation: {} of {} pairs in {} round(s)",
            pairs.len(),
            nodes.len() * (nodes.len() - 1) / 2,
            rounds.len()
        );

        let mut outcome = PairwiseOutcome {
            pairs_planned: pairs.len(),
            ..Default::default()
        };
        let mut tallies: Vec<Tally> = (0..nodes.len()).map(|_| Tally::default()).collect();
        for (round_no, round) in rounds.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(
                    "Pairwise validation cancelled before round {}/{}",
                    round_no + 1,
                    rounds.len()
                );
                outcome.cancelled = true;
                break;
            }
            debug!("Pair round {}/{}: {round:?}", round_no + 1, rounds.len());

            let groups: Vec<NodeGroup> = round
                .iter()
                .filter_map(|&(a, b)| group.pair_at(a, b))
                .collect();
            let results = self.runner.measure_all(groups, PAIR_LABEL).await;
            for (&(a, b), (_, measurement)) in round.iter().zip(results.iter()) {
                outcome.pairs_measured += 1;
                let failed = !measurement.is_healthy(threshold);
                for index in [a, b] {
                    let tally = &mut tallies[index];
                    tally.observed += 1;
                    if failed {
                        tally.failures += 1;
                    }
                    if let Some(bandwidth) = measurement.bandwidth() {
                        tally.bandwidths.push(bandwidth);
                    }
                }
            }
        }

        for (node, tally) in nodes.iter().zip(tallies) {
            if tally.observed == 0 {
                if outcome.cancelled {
                    outcome.unresolved.push(node.clone());
                }
                continue;
            }
            outcome.node_stats.push(NodePairStats {
                node: node.clone(),
                pairs_observed: tally.observed,
                failure_count: tally.failures,
                failure_rate: f64::from(tally.failures) / f64::from(tally.observed),
                average_bandwidth_gb_s: statistics::mean(&tally.bandwidths),
                std_bandwidth_gb_s: statistics::std_dev(&tally.bandwidths),
            });
        }

        for stats in &outcome.node_stats {
            if let Some(reason) = self.flag_reason(stats, threshold) {
                outcome.suspects.push(
                    SuspectRecord::new(
                        stats.node.clone(),
                        DetectionMethod::PairwiseOutlier,
                        stats.confidence(),
                        reason,
                    )
                    .with_stats(stats.suspect_stats()),
                );
            }
        }

        let averages: Vec<(NodeId, f64)> = outcome
            .node_stats
            .iter()
            .filter_map(|s| Some((s.node.clone(), s.average_bandwidth_gb_s?)))
            .collect();
        outcome
            .suspects
            .extend(statistics::detect_outliers(&averages, &self.outliers));

        info!(
            "Pairwise validation finished: {} pair(s) measured, {} suspect record(s)",
            outcome.pairs_measured,
            outcome.suspects.len()
        );
        outcome
    }

    fn flag_reason(&self, stats: &NodePairStats, threshold: &Threshold) -> Option<String> {
        let Some(average) = stats.average_bandwidth_gb_s else {
            return Some(format!(
                "measurement failed in all {} pair(s)",
                stats.pairs_observed
            ));
        };

        let mut reasons = Vec::new();
        if stats.failure_rate > self.failure_rate_threshold {
            reasons.push(format!(
                "failed {} of {} pairs ({:.0}%)",
                stats.failure_count,
                stats.pairs_observed,
                stats.failure_rate * 100.0
            ));
        }
        if !threshold.passes(average) {
            reasons.push(format!(
                "average pair bandwidth {average:.2} GB/s below threshold {:.2} GB/s",
                threshold.value_gb_s
            ));
        }
        if reasons.is_empty() {
            None
        } else {
            Some(reasons.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::history::MeasurementHistory;
    use crate::provider::MockProvider;
    use shared::models::MessageSizePolicy;
    use std::sync::Arc;
    use std::time::Duration;

    fn cluster(n: usize) -> NodeGroup {
        NodeGroup::new((0..n).map(|i| NodeId::from(format!("n{i}"))).collect(), 8).unwrap()
    }

    fn validator(provider: &Arc<MockProvider>, config: &DiagnosisConfig) -> PairwiseValidator {
        let runner = MeasurementRunner::new(
            provider.clone(),
            MeasurementHistory::new(),
            MessageSizePolicy::default(),
            Duration::from_secs(5),
        );
        PairwiseValidator::new(runner, config, CancellationToken::new())
    }

    #[test]
    fn test_plan_without_cap_is_every_combination() {
        let pairs = plan_pairs(8, None, None);
        assert_eq!(pairs.len(), 28);
        assert_eq!(pairs[0], (0, 1));
        assert_eq!(pairs[27], (6, 7));
        assert_eq!(plan_pairs(8, Some(100), None).len(), 28);
        assert!(plan_pairs(1, None, None).is_empty());
    }

    #[test]
    fn test_sampled_plan_covers_every_node() {
        for n in [10, 11] {
            let pairs = plan_pairs(n, Some(8), Some(7));
            assert_eq!(pairs.len(), 8);
            let covered: BTreeSet<usize> = pairs.iter().flat_map(|&(a, b)| [a, b]).collect();
            assert_eq!(covered.len(), n, "n={n}");
            let distinct: BTreeSet<PairIndex> = pairs.iter().copied().collect();
            assert_eq!(distinct.len(), pairs.len());
            assert!(pairs.windows(2).all(|w| w[0] < w[1]));
            assert!(pairs.iter().all(|&(a, b)| a < b));
            assert_eq!(pairs, plan_pairs(n, Some(8), Some(7)));
        }
    }

    #[test]
    fn test_plan_truncates_when_coverage_is_impossible() {
        let pairs = plan_pairs(10, Some(3), Some(1));
        assert_eq!(pairs, vec![(0, 1), (2, 3), (4, 5)]);
    }

    #[test]
    fn test_rounds_are_node_disjoint_and_bounded() {
        let pairs = plan_pairs(6, None, None);
        let rounds = schedule_rounds(&pairs, 2);
        let mut scheduled = 0;
        for round in &rounds {
            assert!(round.len() <= 2);
            let nodes: BTreeSet<usize> = round.iter().flat_map(|&(a, b)| [a, b]).collect();
            assert_eq!(nodes.len(), round.len() * 2);
            scheduled += round.len();
        }
        assert_eq!(scheduled, pairs.len());
        assert_eq!(schedule_rounds(&pairs, 1).len(), 15);
    }

    #[tokio::test]
    async fn test_flags_slow_node_among_eight() {
        let provider = Arc::new(MockProvider::uniform(100.0).with_node_bandwidth("n7", 60.0));
        let outcome = validator(&provider, &DiagnosisConfig::default())
            .cross_validate(&cluster(8), &Threshold::explicit(85.0))
            .await;

        assert_eq!(provider.calls(), 28);
        assert_eq!(outcome.pairs_measured, 28);
        assert!(outcome.suspects.iter().all(|s| s.node.as_str() == "n7"));

        let pairwise = outcome
            .suspects
            .iter()
            .find(|s| s.method == DetectionMethod::PairwiseOutlier)
            .unwrap();
        assert!(pairwise.stats.failure_rate.unwrap() >= 0.5);
        assert_eq!(pairwise.stats.pairs_observed, Some(7));
        assert_eq!(pairwise.confidence, Confidence::High);
        assert!(outcome
            .suspects
            .iter()
            .any(|s| s.method == DetectionMethod::Zscore));

        let healthy = &outcome.node_stats[0];
        assert_eq!(healthy.failure_count, 1);
        assert!(healthy.failure_rate < 0.5);
    }

    #[tokio::test]
    async fn test_failed_pairs_count_against_both_ends() {
        let provider = Arc::new(MockProvider::uniform(100.0).with_failing_node("n3"));
        let outcome = validator(&provider, &DiagnosisConfig::default())
            .cross_validate(&cluster(4), &Threshold::explicit(85.0))
            .await;

        assert_eq!(outcome.suspects.len(), 1);
        let suspect = &outcome.suspects[0];
        assert_eq!(suspect.node.as_str(), "n3");
        assert!(suspect.reason.starts_with("measurement failed"));
        assert_eq!(suspect.confidence, Confidence::Medium);
        assert_eq!(suspect.stats.failure_count, Some(3));

        let n0 = &outcome.node_stats[0];
        assert_eq!(n0.failure_count, 1);
        assert_eq!(n0.average_bandwidth_gb_s, Some(100.0));
    }

    #[tokio::test]
    async fn test_single_pair_gives_low_confidence() {
        let provider = Arc::new(MockProvider::uniform(100.0).with_node_bandwidth("n1", 30.0));
        let outcome = validator(&provider, &DiagnosisConfig::default())
            .cross_validate(&cluster(2), &Threshold::explicit(85.0))
            .await;

        assert_eq!(outcome.suspects.len(), 2);
        assert!(outcome.suspects.iter().all(|s| s.confidence == Confidence::Low));
    }

    #[tokio::test]
    async fn test_concurrent_rounds_never_share_nodes() {
        let provider = Arc::new(
            MockProvider::uniform(100.0)
                .with_node_bandwidth("n4", 50.0)
                .with_latency(Duration::from_millis(5)),
        );
        let config = DiagnosisConfig {
            parallelism: 4,
            ..Default::default()
        };
        let outcome = validator(&provider, &config)
            .cross_validate(&cluster(8), &Threshold::explicit(85.0))
            .await;

        assert_eq!(provider.calls(), 28);
        assert!(!provider.overlap_detected());
        assert!(provider.peak_concurrency() <= 4);
        assert!(provider.peak_concurrency() > 1);
        assert!(outcome
            .suspects
            .iter()
            .any(|s| s.node.as_str() == "n4" && s.method == DetectionMethod::PairwiseOutlier));
    }

    #[tokio::test]
    async fn test_cancelled_validation_reports_untested_nodes() {
        let provider = Arc::new(MockProvider::uniform(100.0));
        let runner = MeasurementRunner::new(
            provider.clone(),
            MeasurementHistory::new(),
            MessageSizePolicy::default(),
            Duration::from_secs(5),
        );
        let token = CancellationToken::new();
        token.cancel();
        let outcome = PairwiseValidator::new(runner, &DiagnosisConfig::default(), token)
            .cross_validate(&cluster(4), &Threshold::explicit(85.0))
            .await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.unresolved.len(), 4);
        assert_eq!(provider.calls(), 0);
    }
}
