pub mod bisection;
pub mod history;
pub mod isolation;
pub mod measure;
pub mod pairwise;
pub mod statistics;
pub mod threshold;


use chrono::Utc;
use log::{info, warn};
use shared::models::{
    Confidence, DetectionMethod, DetectionMode, DiagnosisReport, NodeGroup, NodeId, SuspectRecord,
    Threshold,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use self::bisection::BisectionDiagnoser;
use self::history::MeasurementHistory;
use self::measure::{failure_reason, MeasurementRunner};
use self::pairwise::PairwiseValidator;
use self::statistics::OutlierConfig;
use crate::config::DiagnosisConfig;
use crate::error::{DiagnosisError, Result};
use crate::metrics::MetricsContext;
use crate::provider::MeasurementProvider;

pub const SINGLE_LABEL: &str = "single";

/// Partial findings of one detection stage.
#[derive(Default)]
struct StageOutcome {
    suspects: Vec<SuspectRecord>,
    unresolved: Vec<NodeId>,
    cancelled: bool,
}

/// One diagnosis run over a node inventory.
///
/// Owns the run's measurement history; nothing is shared between runs.
pub struct Diagnosis {
    run_id: String,
    config: DiagnosisConfig,
    provider: Arc<dyn MeasurementProvider>,
    cancel: CancellationToken,
    metrics: Option<MetricsContext>,
}

impl Diagnosis {
    pub fn new(
        config: DiagnosisConfig,
        provider: Arc<dyn MeasurementProvider>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            config,
            provider,
            cancel,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self) -> Self {
        self.metrics = Some(MetricsContext::new(self.run_id.clone()));
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn run(&self, nodes: Vec<NodeId>) -> Result<DiagnosisReport> {
        self.config.validate()?;
        if nodes.is_empty() {
            return Err(DiagnosisError::InvalidConfig(
                "node set is empty".to_string(),
            ));
        }
        let group = NodeGroup::new(nodes, self.config.slots_per_node)?;

        let timestamp = Utc::now();
        let started = Instant::now();
        info!(
            "Starting {} diagnosis {} over {} node(s)",
            self.config.mode,
            self.run_id,
            group.len()
        );

        let history = MeasurementHistory::new();
        let mut runner = MeasurementRunner::new(
            self.provider.clone(),
            history.clone(),
            self.config.message_policy,
            self.config.timeout,
        );
        if let Some(metrics) = &self.metrics {
            runner = runner.with_metrics(metrics.clone());
        }

        // Single-node bandwidth is never compared against a group threshold.
        let calibration_group =
            (self.config.mode != DetectionMode::LegacyStatistical).then_some(&group);
        let threshold = threshold::resolve_threshold(
            self.config.threshold_gb_s,
            self.config.safety_margin,
            calibration_group,
            &runner,
        )
        .await?;

        let mut stages = Vec::new();
        if self.config.mode.runs_bisection() {
            let diagnoser = BisectionDiagnoser::new(
                runner.clone(),
                self.config.strategy,
                self.config.parallelism,
                self.cancel.clone(),
            );
            let outcome = diagnoser.diagnose(group.clone(), &threshold).await;
            stages.push(StageOutcome {
                suspects: outcome.suspects,
                unresolved: outcome.unresolved,
                cancelled: outcome.cancelled,
            });
        }
        if self.config.mode.runs_pairwise() {
            let validator = PairwiseValidator::new(runner.clone(), &self.config, self.cancel.clone());
            let outcome = validator.cross_validate(&group, &threshold).await;
            stages.push(StageOutcome {
                suspects: outcome.suspects,
                unresolved: outcome.unresolved,
                cancelled: outcome.cancelled,
            });
        }
        if self.config.mode == DetectionMode::LegacyStatistical {
            stages.push(self.single_node_analysis(&group, &threshold, &runner).await);
        }

        let report = self
            .assemble(timestamp, started, &group, threshold, &history, stages)
            .await;
        if let Some(metrics) = &self.metrics {
            let mut per_method: BTreeMap<DetectionMethod, BTreeSet<&NodeId>> = BTreeMap::new();
            for suspect in &report.suspects {
                per_method.entry(suspect.method).or_default().insert(&suspect.node);
            }
            for (method, nodes) in per_method {
                metrics.record_suspects(&method.to_string(), nodes.len());
            }
            metrics.record_run_duration(&report.mode.to_string(), report.duration_seconds);
        }
        Ok(report)
    }

    /// Measures every node on its own and looks for statistical outliers.
    async fn single_node_analysis(
        &self,
        group: &NodeGroup,
        threshold: &Threshold,
        runner: &MeasurementRunner,
    ) -> StageOutcome {
        let mut outcome = StageOutcome::default();
        let mut samples = Vec::new();
        let singles: Vec<NodeGroup> = group
            .nodes()
            .iter()
            .map(|node| NodeGroup::single(node.clone(), group.slots_per_node()))
            .collect();

        for (index, wave) in singles.chunks(self.config.parallelism).enumerate() {
            if self.cancel.is_cancelled() {
                let remaining = &group.nodes()[index * self.config.parallelism..];
                info!("Single-node analysis cancelled with {} node(s) left", remaining.len());
                outcome.cancelled = true;
                outcome.unresolved.extend(remaining.iter().cloned());
                break;
            }
            for (single, measurement) in runner.measure_all(wave.to_vec(), SINGLE_LABEL).await {
                let node = single.nodes()[0].clone();
                // Single-node bandwidth is not comparable to the group threshold.
                match measurement.bandwidth() {
                    Some(bandwidth) => samples.push((node, bandwidth)),
                    None => outcome.suspects.push(SuspectRecord::new(
                        node,
                        DetectionMethod::SingleNode,
                        Confidence::Medium,
                        failure_reason(&measurement, threshold),
                    )),
                }
            }
        }

        if let Some(summary) = statistics::summarize(
            &samples.iter().map(|(_, bandwidth)| *bandwidth).collect::<Vec<_>>(),
        ) {
            info!(
                "Single-node bandwidth: mean {:.2}, median {:.2}, std {:.2}, min {:.2}, max {:.2} GB/s",
                summary.mean, summary.median, summary.std_dev, summary.min, summary.max
            );
        }
        outcome.suspects.extend(statistics::detect_outliers(
            &samples,
            &OutlierConfig::from(&self.config),
        ));
        outcome
    }

    async fn assemble(
        &self,
        timestamp: chrono::DateTime<Utc>,
        started: Instant,
        group: &NodeGroup,
        threshold: Threshold,
        history: &MeasurementHistory,
        stages: Vec<StageOutcome>,
    ) -> DiagnosisReport {
        let nodes = group.nodes().to_vec();
        let mut suspects = Vec::new();
        let mut unresolved_set = BTreeSet::new();
        let mut cancelled = false;
        for stage in stages {
            suspects.extend(stage.suspects);
            unresolved_set.extend(stage.unresolved);
            cancelled |= stage.cancelled;
        }

        let bad_nodes: Vec<NodeId> = isolation::merge_suspects(&nodes, &suspects)
            .into_iter()
            .map(|entry| entry.node)
            .collect();
        let unresolved_nodes: Vec<NodeId> = nodes
            .iter()
            .filter(|node| unresolved_set.contains(*node) && !bad_nodes.contains(node))
            .cloned()
            .collect();
        let good_nodes: Vec<NodeId> = nodes
            .iter()
            .filter(|node| !bad_nodes.contains(node) && !unresolved_nodes.contains(node))
            .cloned()
            .collect();

        let measurements = history.snapshot().await;
        let duration_seconds = started.elapsed().as_secs_f64();
        if cancelled {
            warn!(
                "Run {} was cancelled; {} node(s) left unresolved",
                self.run_id,
                unresolved_nodes.len()
            );
        }
        info!(
            "Run {} finished in {duration_seconds:.1}s: {} test(s), {} bad, {} good",
            self.run_id,
            measurements.len(),
            bad_nodes.len(),
            good_nodes.len()
        );
        if !bad_nodes.is_empty() {
            let names: Vec<&str> = bad_nodes.iter().map(NodeId::as_str).collect();
            warn!("Bad nodes: {}", names.join(", "));
        }

        DiagnosisReport {
            run_id: self.run_id.clone(),
            timestamp,
            mode: self.config.mode,
            total_nodes: nodes.len(),
            total_tests: measurements.len(),
            duration_seconds,
            threshold,
            nodes,
            bad_nodes,
            good_nodes,
            unresolved_nodes,
            cancelled,
            suspects,
            measurements,
        }
    }
}
