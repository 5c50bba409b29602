use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use shared::models::node::load_hostfile;
use shared::models::{DetectionMode, MessageSizePolicy, NodeId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{
    BisectionStrategy, DiagnosisConfig, DEFAULT_FAILURE_RATE_THRESHOLD, DEFAULT_IQR_MULTIPLIER,
    DEFAULT_SAFETY_MARGIN, DEFAULT_SIGMA_THRESHOLD, DEFAULT_SLOTS_PER_NODE, DEFAULT_TIMEOUT_SECS,
};
use crate::diagnosis::statistics::{self, OutlierConfig};
use crate::diagnosis::{isolation, Diagnosis};
use crate::export::{self, ExportFormat};
use crate::metrics::export_metrics;
use crate::provider::mpi::DEFAULT_BENCHMARK_BINARY;
use crate::provider::{MeasurementProvider, MockProvider, MpiProvider};
use crate::store::FileStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// mpirun + all_reduce_perf across the real nodes
    Mpi,
    /// Deterministic simulated bandwidths, for dry runs
    Mock,
}

#[derive(Parser)]
#[command(author, version, about = "Locate GPU nodes with degraded interconnect bandwidth", long_about = None)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Diagnose the nodes of a hostfile
    Run {
        /// MPI hostfile listing the nodes to test
        #[arg(long)]
        hostfile: PathBuf,

        #[arg(long, default_value_t = DEFAULT_SLOTS_PER_NODE)]
        gpus_per_node: u32,

        /// bisection, pairwise, both or legacy-statistical
        #[arg(long, default_value = "bisection")]
        mode: DetectionMode,

        /// Bandwidth floor in GB/s; auto-calibrated from the full set when omitted
        #[arg(long)]
        threshold: Option<f64>,

        /// Fraction of the calibration baseline used as threshold
        #[arg(long, default_value_t = DEFAULT_SAFETY_MARGIN)]
        safety_margin: f64,

        #[arg(long, default_value_t = DEFAULT_SIGMA_THRESHOLD)]
        sigma: f64,

        #[arg(long, default_value_t = DEFAULT_IQR_MULTIPLIER)]
        iqr_multiplier: f64,

        /// Flag a node when more than this fraction of its pairs fail
        #[arg(long, default_value_t = DEFAULT_FAILURE_RATE_THRESHOLD)]
        failure_rate: f64,

        /// Cap on the number of pairs tested in pairwise mode
        #[arg(long)]
        max_pairs: Option<usize>,

        /// Seed for pair sampling
        #[arg(long)]
        seed: Option<u64>,

        /// Per-measurement timeout
        #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
        timeout_secs: u64,

        #[arg(long, value_enum, default_value_t = BisectionStrategy::Exhaustive)]
        strategy: BisectionStrategy,

        /// Maximum number of node-disjoint measurements in flight
        #[arg(long, default_value_t = 1)]
        parallelism: usize,

        #[arg(long, value_enum, default_value_t = ProviderKind::Mpi)]
        provider: ProviderKind,

        /// JSON bandwidth profile for the mock provider
        #[arg(long)]
        mock_profile: Option<PathBuf>,

        #[arg(long, default_value = DEFAULT_BENCHMARK_BINARY)]
        benchmark_binary: String,

        #[arg(long, default_value = "./results")]
        output_dir: PathBuf,

        /// Write Prometheus text metrics here after the run
        #[arg(long)]
        metrics_file: Option<PathBuf>,
    },

    /// Statistical outlier analysis of previously collected bandwidths
    Analyze {
        /// JSON object mapping node name to bandwidth in GB/s
        #[arg(long)]
        input: PathBuf,

        #[arg(long, default_value_t = DEFAULT_SIGMA_THRESHOLD)]
        sigma: f64,

        #[arg(long, default_value_t = DEFAULT_IQR_MULTIPLIER)]
        iqr_multiplier: f64,
    },

    /// Render the isolation decision of a saved report
    Isolate {
        /// diagnosis_report_<run_id>.json written by `run`
        #[arg(long)]
        report: PathBuf,

        /// Hostfile to rewrite, required for the hostfile format
        #[arg(long)]
        hostfile: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,

        /// Write here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

impl Cli {
    /// Returns the process exit code: 1 when bad nodes or outliers were found.
    pub async fn run(&self, cancellation_token: CancellationToken) -> anyhow::Result<i32> {
        match &self.command {
            Commands::Run {
                hostfile,
                gpus_per_node,
                mode,
                threshold,
                safety_margin,
                sigma,
                iqr_multiplier,
                failure_rate,
                max_pairs,
                seed,
                timeout_secs,
                strategy,
                parallelism,
                provider,
                mock_profile,
                benchmark_binary,
                output_dir,
                metrics_file,
            } => {
                let entries = load_hostfile(hostfile)?;
                if let Some(entry) = entries
                    .iter()
                    .find(|e| e.slots.is_some_and(|slots| slots != *gpus_per_node))
                {
                    warn!(
                        "Hostfile lists {} with {} slots; using --gpus-per-node={gpus_per_node} for every node",
                        entry.node,
                        entry.slots.unwrap_or_default()
                    );
                }
                let nodes: Vec<NodeId> = entries.into_iter().map(|e| e.node).collect();

                let config = DiagnosisConfig {
                    mode: *mode,
                    threshold_gb_s: *threshold,
                    safety_margin: *safety_margin,
                    sigma_threshold: *sigma,
                    iqr_multiplier: *iqr_multiplier,
                    failure_rate_threshold: *failure_rate,
                    max_pairs: *max_pairs,
                    pair_seed: *seed,
                    timeout: Duration::from_secs(*timeout_secs),
                    strategy: *strategy,
                    parallelism: *parallelism,
                    slots_per_node: *gpus_per_node,
                    message_policy: MessageSizePolicy::default(),
                };

                std::fs::create_dir_all(output_dir).with_context(|| {
                    format!("failed to create output dir {}", output_dir.display())
                })?;
                let provider: Arc<dyn MeasurementProvider> = match provider {
                    ProviderKind::Mpi => Arc::new(
                        MpiProvider::new(benchmark_binary.clone())
                            .with_scratch_dir(output_dir.clone()),
                    ),
                    ProviderKind::Mock => match mock_profile {
                        Some(path) => Arc::new(MockProvider::load(path)?),
                        None => Arc::new(MockProvider::default()),
                    },
                };

                let diagnosis = Diagnosis::new(config, provider, cancellation_token).with_metrics();
                let report = diagnosis.run(nodes).await?;

                let store = FileStore::new(output_dir.clone());
                store.save_report(&report)?;
                let decision = isolation::build(&report)?;
                store.save_decision(&decision)?;

                if let Some(path) = metrics_file {
                    std::fs::write(path, export_metrics()?)
                        .with_context(|| format!("failed to write metrics to {}", path.display()))?;
                }

                if decision.is_clean() {
                    info!("No bad nodes found among {} node(s)", report.total_nodes);
                    Ok(0)
                } else {
                    for entry in &decision.bad {
                        warn!("{} [{}] {}", entry.node, entry.confidence, entry.reason);
                    }
                    if let Some(exclude) = export::slurm_exclude(&decision) {
                        info!("{exclude}");
                    }
                    Ok(1)
                }
            }

            Commands::Analyze {
                input,
                sigma,
                iqr_multiplier,
            } => {
                let content = std::fs::read_to_string(input)
                    .with_context(|| format!("failed to read {}", input.display()))?;
                let samples: BTreeMap<NodeId, f64> = serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse {}", input.display()))?;
                let samples: Vec<(NodeId, f64)> = samples.into_iter().collect();

                let config = OutlierConfig {
                    sigma_threshold: *sigma,
                    iqr_multiplier: *iqr_multiplier,
                    low_side_only: false,
                };
                config.validate()?;
                let values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
                let suspects = statistics::detect_outliers(&samples, &config);
                let output = serde_json::json!({
                    "statistics": statistics::summarize(&values),
                    "suspects": suspects,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
                Ok(if suspects.is_empty() { 0 } else { 1 })
            }

            Commands::Isolate {
                report,
                hostfile,
                format,
                output,
            } => {
                let report = FileStore::load_report(report)
                    .with_context(|| format!("failed to load report {}", report.display()))?;
                let decision = isolation::build(&report)?;
                let hostfile_content = match hostfile {
                    Some(path) => Some(
                        std::fs::read_to_string(path)
                            .with_context(|| format!("failed to read {}", path.display()))?,
                    ),
                    None => None,
                };
                let rendered = export::render(&decision, *format, hostfile_content.as_deref())?;
                match output {
                    Some(path) => {
                        std::fs::write(path, &rendered)
                            .with_context(|| format!("failed to write {}", path.display()))?;
                        info!(
                            "Wrote decision with {} bad node(s) to {}",
                            decision.bad.len(),
                            path.display()
                        );
                    }
                    None => println!("{rendered}"),
                }
                Ok(0)
            }
        }
    }
}
