use async_trait::async_trait;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use shared::models::{MessageSizePolicy, NodeGroup};
use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use super::MeasurementProvider;
use crate::error::MeasurementError;

pub const DEFAULT_MPIRUN: &str = "mpirun";
pub const DEFAULT_BENCHMARK_BINARY: &str = "/usr/local/bin/all_reduce_perf";

lazy_static! {
    // size count type redop [root] time algbw busbw ...
    static ref RESULT_ROW: Regex = Regex::new(
        r"^\s*\d+\s+\d+\s+\w+\s+\w+\s+(?:-?\d+\s+)?[\d.]+\s+[\d.]+\s+([\d.]+)"
    )
    .unwrap();
    static ref AVG_BUS_BANDWIDTH: Regex =
        Regex::new(r"Avg bus bandwidth\s*:\s*([\d.]+)").unwrap();
}

/// Launches `all_reduce_perf` across a node group through `mpirun`.
#[derive(Debug, Clone)]
pub struct MpiProvider {
    mpirun: String,
    benchmark_binary: String,
    scratch_dir: Option<PathBuf>,
    extra_env: Vec<String>,
}

impl Default for MpiProvider {
    fn default() -> Self {
        Self {
            mpirun: DEFAULT_MPIRUN.to_string(),
            benchmark_binary: DEFAULT_BENCHMARK_BINARY.to_string(),
            scratch_dir: None,
            extra_env: vec![
                "NCCL_DEBUG=WARN".to_string(),
                "NCCL_IB_DISABLE=0".to_string(),
                "LD_LIBRARY_PATH".to_string(),
            ],
        }
    }
}

impl MpiProvider {
    pub fn new(benchmark_binary: impl Into<String>) -> Self {
        Self {
            benchmark_binary: benchmark_binary.into(),
            ..Default::default()
        }
    }

    pub fn with_mpirun(mut self, mpirun: impl Into<String>) -> Self {
        self.mpirun = mpirun.into();
        self
    }

    /// Directory for the per-test hostfiles; the system temp dir otherwise.
    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = Some(dir);
        self
    }

    pub fn with_env(mut self, var: impl Into<String>) -> Self {
        self.extra_env.push(var.into());
        self
    }

    fn write_hostfile(&self, group: &NodeGroup) -> std::io::Result<tempfile::NamedTempFile> {
        let mut file = match &self.scratch_dir {
            Some(dir) => tempfile::Builder::new().prefix("hostfile_").tempfile_in(dir)?,
            None => tempfile::Builder::new().prefix("hostfile_").tempfile()?,
        };
        for node in group.nodes() {
            writeln!(file, "{node} slots={}", group.slots_per_node())?;
        }
        file.flush()?;
        Ok(file)
    }

    fn build_args(&self, hostfile: &str, group: &NodeGroup, policy: &MessageSizePolicy) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--allow-run-as-root".into(),
            "--hostfile".into(),
            hostfile.into(),
            "-np".into(),
            group.total_slots().to_string(),
            "--bind-to".into(),
            "none".into(),
            "--map-by".into(),
            "slot".into(),
            "-mca".into(),
            "pml".into(),
            "ob1".into(),
            "-mca".into(),
            "btl".into(),
            "^openib".into(),
        ];
        for var in &self.extra_env {
            args.push("-x".into());
            args.push(var.clone());
        }
        args.extend([
            self.benchmark_binary.clone(),
            "-b".into(),
            policy.min_bytes.to_string(),
            "-e".into(),
            policy.max_bytes.to_string(),
            "-f".into(),
            policy.step_factor.to_string(),
            "-g".into(),
            "1".into(),
            "-c".into(),
            "1".into(),
            "-n".into(),
            policy.iterations.to_string(),
        ]);
        args
    }
}

/// Extracts the bus bandwidth (GB/s) from `all_reduce_perf` output.
///
/// Prefers the summary line; falls back to averaging the per-size rows.
pub fn parse_bus_bandwidth(output: &str) -> Option<f64> {
    if let Some(value) = AVG_BUS_BANDWIDTH
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Some(value);
    }

    let rows: Vec<f64> = output
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| RESULT_ROW.captures(line))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<f64>().ok())
        .collect();
    if rows.is_empty() {
        None
    } else {
        Some(rows.iter().sum::<f64>() / rows.len() as f64)
    }
}

fn tail(text: &str, lines: usize) -> String {
    let collected: Vec<&str> = text.lines().rev().take(lines).collect();
    collected.into_iter().rev().collect::<Vec<_>>().join(" | ")
}

#[async_trait]
impl MeasurementProvider for MpiProvider {
    async fn measure(
        &self,
        group: &NodeGroup,
        policy: &MessageSizePolicy,
    ) -> Result<f64, MeasurementError> {
        let hostfile = self.write_hostfile(group).map_err(|e| {
            MeasurementError::ProviderError(format!("failed to write hostfile: {e}"))
        })?;
        let hostfile_path = hostfile.path().to_string_lossy().into_owned();
        let args = self.build_args(&hostfile_path, group, policy);
        debug!("Running {} {}", self.mpirun, args.join(" "));

        let output = Command::new(&self.mpirun)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                MeasurementError::ProviderError(format!("failed to launch {}: {e}", self.mpirun))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MeasurementError::ProviderError(format!(
                "benchmark exited with {}: {}",
                output.status,
                tail(&stderr, 3)
            )));
        }

        match parse_bus_bandwidth(&stdout) {
            Some(bandwidth) => Ok(bandwidth),
            None => {
                warn!(
                    "No bandwidth found in benchmark output for {}",
                    group.describe()
                );
                Err(MeasurementError::ProviderError(
                    "no bandwidth figures in benchmark output".to_string(),
                ))
            }
        }
    }
}
