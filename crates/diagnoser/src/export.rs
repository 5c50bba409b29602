//! Scheduler-specific renderings of an isolation decision.

use serde_json::json;
use shared::models::IsolationDecision;
use std::collections::BTreeSet;

use crate::error::{DiagnosisError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    /// Input hostfile with bad hosts commented out
    Hostfile,
    /// `#SBATCH --exclude=` directive
    Slurm,
    /// nodeAffinity block excluding bad hosts
    Kubernetes,
    /// The decision itself
    Json,
}

/// Comments out every hostfile line whose host is bad. Comments and blank
/// lines are kept verbatim. Returns the new content and the excluded count.
pub fn render_hostfile(content: &str, decision: &IsolationDecision) -> (String, usize) {
    let bad: BTreeSet<&str> = decision.bad_node_ids().map(|n| n.as_str()).collect();
    let mut excluded = 0;
    let mut rendered = String::with_capacity(content.len());
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim();
        let host = trimmed.split_whitespace().next();
        match host {
            Some(host) if !trimmed.starts_with('#') && bad.contains(host) => {
                rendered.push_str("# ISOLATED: ");
                rendered.push_str(line);
                excluded += 1;
            }
            _ => rendered.push_str(line),
        }
    }
    (rendered, excluded)
}

/// `None` when there is nothing to exclude.
pub fn slurm_exclude(decision: &IsolationDecision) -> Option<String> {
    if decision.is_clean() {
        return None;
    }
    let hosts: BTreeSet<&str> = decision.bad_node_ids().map(|n| n.as_str()).collect();
    Some(format!(
        "#SBATCH --exclude={}",
        hosts.into_iter().collect::<Vec<_>>().join(",")
    ))
}

pub fn kubernetes_affinity(decision: &IsolationDecision) -> serde_json::Value {
    let hosts: Vec<&str> = decision.bad_node_ids().map(|n| n.as_str()).collect();
    json!({
        "affinity": {
            "nodeAffinity": {
                "requiredDuringSchedulingIgnoredDuringExecution": {
                    "nodeSelectorTerms": [{
                        "matchExpressions": [{
                            "key": "kubernetes.io/hostname",
                            "operator": "NotIn",
                            "values": hosts
                        }]
                    }]
                }
            }
        }
    })
}

pub fn render(
    decision: &IsolationDecision,
    format: ExportFormat,
    hostfile: Option<&str>,
) -> Result<String> {
    match format {
        ExportFormat::Hostfile => {
            let content = hostfile.ok_or_else(|| {
                DiagnosisError::InvalidConfig("hostfile format needs the original hostfile".to_string())
            })?;
            Ok(render_hostfile(content, decision).0)
        }
        ExportFormat::Slurm => Ok(slurm_exclude(decision)
            .unwrap_or_else(|| "# no nodes to exclude".to_string())),
        ExportFormat::Kubernetes => Ok(serde_json::to_string_pretty(&kubernetes_affinity(decision))?),
        ExportFormat::Json => Ok(serde_json::to_string_pretty(decision)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::models::{Confidence, DetectionMethod, IsolationEntry, NodeId};

    fn decision(bad: &[&str], good: &[&str]) -> IsolationDecision {
        IsolationDecision {
            run_id: "run-1".to_string(),
            threshold_gb_s: 170.0,
            bad: bad
                .iter()
                .map(|n| IsolationEntry {
                    node: NodeId::from(*n),
                    confidence: Confidence::High,
                    methods: vec![DetectionMethod::Bisection],
                    reason: "bisection: measurement failed".to_string(),
                })
                .collect(),
            good: good.iter().map(|n| NodeId::from(*n)).collect(),
        }
    }

    #[test]
    fn test_hostfile_comments_out_bad_hosts() {
        let content = "# cluster\ngpu-01 slots=8\ngpu-02 slots=8\n\ngpu-03 slots=8";
        let (rendered, excluded) = render_hostfile(content, &decision(&["gpu-02", "gpu-03"], &["gpu-01"]));
        assert_eq!(excluded, 2);
        assert_eq!(
            rendered,
            "# cluster\ngpu-01 slots=8\n# ISOLATED: gpu-02 slots=8\n\n# ISOLATED: gpu-03 slots=8"
        );
    }

    #[test]
    fn test_hostfile_keeps_commented_bad_host() {
        let content = "# gpu-02 slots=8\n";
        let (rendered, excluded) = render_hostfile(content, &decision(&["gpu-02"], &[]));
        assert_eq!(excluded, 0);
        assert_eq!(rendered, content);
    }

    #[test]
    fn test_slurm_exclude_is_sorted() {
        let d = decision(&["gpu-09", "gpu-02"], &["gpu-01"]);
        assert_eq!(slurm_exclude(&d).unwrap(), "#SBATCH --exclude=gpu-02,gpu-09");
        assert_eq!(slurm_exclude(&decision(&[], &["gpu-01"])), None);
    }

    #[test]
    fn test_kubernetes_affinity_lists_bad_hosts() {
        let value = kubernetes_affinity(&decision(&["gpu-02"], &["gpu-01"]));
        let expr = &value["affinity"]["nodeAffinity"]["requiredDuringSchedulingIgnoredDuringExecution"]
            ["nodeSelectorTerms"][0]["matchExpressions"][0];
        assert_eq!(expr["operator"], "NotIn");
        assert_eq!(expr["values"], json!(["gpu-02"]));
    }

    #[test]
    fn test_hostfile_format_requires_content() {
        let result = render(&decision(&["a"], &[]), ExportFormat::Hostfile, None);
        assert!(matches!(result, Err(DiagnosisError::InvalidConfig(_))));
    }
}
