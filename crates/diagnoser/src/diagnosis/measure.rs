use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use shared::models::{Measurement, MessageSizePolicy, NodeGroup, Threshold};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::history::{MeasurementHistory, TestKey};
use crate::error::MeasurementError;
use crate::metrics::MetricsContext;
use crate::provider::MeasurementProvider;

/// Single entry point through which diagnosers talk to the benchmark.
///
/// Enforces the per-call timeout, turns every provider failure into a failed
/// measurement, and answers repeated tests from the run history.
#[derive(Clone)]
pub struct MeasurementRunner {
    provider: Arc<dyn MeasurementProvider>,
    history: MeasurementHistory,
    policy: MessageSizePolicy,
    timeout: Duration,
    metrics: Option<MetricsContext>,
}

impl MeasurementRunner {
    pub fn new(
        provider: Arc<dyn MeasurementProvider>,
        history: MeasurementHistory,
        policy: MessageSizePolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            history,
            policy,
            timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn history(&self) -> &MeasurementHistory {
        &self.history
    }

    /// Measures `group`, or returns the earlier measurement of the same test.
    pub async fn measure(&self, group: &NodeGroup, label: &str) -> Measurement {
        let key = TestKey::new(group, &self.policy);
        if let Some(prior) = self.history.lookup(&key).await {
            debug!(
                "Reusing measurement #{} for {} ({label})",
                prior.sequence,
                group.describe()
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_reuse(label);
            }
            return prior;
        }

        let timestamp = Utc::now();
        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.timeout,
            self.provider.measure(group, &self.policy),
        )
        .await
        {
            Ok(Ok(bandwidth)) if bandwidth.is_finite() && bandwidth >= 0.0 => Ok(bandwidth),
            Ok(Ok(bandwidth)) => Err(MeasurementError::ProviderError(format!(
                "provider returned invalid bandwidth {bandwidth}"
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MeasurementError::ProviderTimeout(self.timeout)),
        };
        let elapsed = started.elapsed().as_secs_f64();

        let (bandwidth_gb_s, failure_reason) = match outcome {
            Ok(bandwidth) => {
                info!(
                    "{label}: {} node(s) {} -> {bandwidth:.2} GB/s in {elapsed:.1}s",
                    group.len(),
                    group.describe()
                );
                (Some(bandwidth), None)
            }
            Err(e) => {
                warn!(
                    "{label}: {} node(s) {} failed: {e}",
                    group.len(),
                    group.describe()
                );
                (None, Some(e.to_string()))
            }
        };

        let measurement = self
            .history
            .record(Measurement {
                sequence: 0,
                label: label.to_string(),
                nodes: group.nodes().to_vec(),
                slots_per_node: group.slots_per_node(),
                policy: self.policy,
                success: failure_reason.is_none(),
                bandwidth_gb_s,
                failure_reason,
                timestamp,
                elapsed_seconds: elapsed,
            })
            .await;

        if let Some(metrics) = &self.metrics {
            let result = if measurement.success { "ok" } else { "failed" };
            metrics.record_measurement(label, result, elapsed);
        }
        measurement
    }

    /// Measures every group concurrently. Callers pass node-disjoint groups.
    /// Results come back in input order regardless of completion order.
    pub async fn measure_all(
        &self,
        groups: Vec<NodeGroup>,
        label: &str,
    ) -> Vec<(NodeGroup, Measurement)> {
        let mut in_flight: FuturesUnordered<_> = groups
            .into_iter()
            .enumerate()
            .map(|(index, group)| async move {
                let measurement = self.measure(&group, label).await;
                (index, group, measurement)
            })
            .collect();

        let mut finished = Vec::with_capacity(in_flight.len());
        while let Some(result) = in_flight.next().await {
            finished.push(result);
        }
        finished.sort_by_key(|(index, _, _)| *index);
        finished
            .into_iter()
            .map(|(_, group, measurement)| (group, measurement))
            .collect()
    }
}

/// Human-readable reason why a measurement does not clear the threshold.
pub(crate) fn failure_reason(measurement: &Measurement, threshold: &Threshold) -> String {
    match measurement.bandwidth() {
        Some(bandwidth) => format!(
            "bandwidth {bandwidth:.2} GB/s below threshold {:.2} GB/s",
            threshold.value_gb_s
        ),
        None => match &measurement.failure_reason {
            Some(reason) => format!("measurement failed: {reason}"),
            None => "measurement failed".to_string(),
        },
    }
}
