use log::{info, warn};
use shared::models::{NodeGroup, Threshold};

use super::measure::MeasurementRunner;
use crate::error::{DiagnosisError, Result};

pub const CALIBRATION_LABEL: &str = "calibration";

/// Resolves the run's bandwidth floor.
///
/// An explicit threshold is used as given. Otherwise the calibration group is
/// measured once (or its earlier measurement reused) and the threshold becomes
/// `baseline * safety_margin`. Calibration assumes at most a minority of the
/// group is degraded; a mostly-bad cluster yields a threshold that is too low.
///
/// Without a calibration group, or when the baseline fails or reads zero, the
/// threshold is unavailable and only failed measurements count against a
/// group. The failed baseline stays in the run history.
pub async fn resolve_threshold(
    explicit_gb_s: Option<f64>,
    safety_margin: f64,
    calibration_group: Option<&NodeGroup>,
    runner: &MeasurementRunner,
) -> Result<Threshold> {
    if let Some(value) = explicit_gb_s {
        if !value.is_finite() || value <= 0.0 {
            return Err(DiagnosisError::InvalidConfig(format!(
                "threshold must be a positive number of GB/s, got {value}"
            )));
        }
        let threshold = Threshold::explicit(value);
        info!("Using threshold {threshold}");
        return Ok(threshold);
    }

    if !(safety_margin > 0.0 && safety_margin <= 1.0) {
        return Err(DiagnosisError::InvalidConfig(format!(
            "safety margin must be in (0, 1], got {safety_margin}"
        )));
    }
    let Some(group) = calibration_group else {
        info!("No threshold configured and nothing to calibrate against");
        return Ok(Threshold::unavailable());
    };

    info!(
        "No threshold configured, calibrating against {} node(s)",
        group.len()
    );
    let baseline = runner.measure(group, CALIBRATION_LABEL).await;
    let bandwidth = match baseline.bandwidth() {
        Some(bandwidth) if bandwidth > 0.0 => bandwidth,
        Some(_) => {
            warn!("Calibration baseline is zero; continuing without a bandwidth threshold");
            return Ok(Threshold::unavailable());
        }
        None => {
            warn!(
                "Calibration measurement failed ({}); continuing without a bandwidth threshold",
                baseline
                    .failure_reason
                    .as_deref()
                    .unwrap_or("no reason given")
            );
            return Ok(Threshold::unavailable());
        }
    };

    let threshold = Threshold::calibrated(bandwidth, safety_margin);
    warn!("Auto-calibrated threshold {threshold}; assumes most of the calibration set is healthy");
    Ok(threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::history::MeasurementHistory;
    use crate::provider::MockProvider;
    use shared::models::{MessageSizePolicy, NodeId, ThresholdSource};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(provider: MockProvider) -> (Arc<MockProvider>, MeasurementRunner) {
        let provider = Arc::new(provider);
        let runner = MeasurementRunner::new(
            provider.clone(),
            MeasurementHistory::new(),
            MessageSizePolicy::default(),
            Duration::from_secs(5),
        );
        (provider, runner)
    }

    fn cluster(n: usize) -> NodeGroup {
        NodeGroup::new((0..n).map(|i| NodeId::from(format!("n{i}"))).collect(), 8).unwrap()
    }

    #[tokio::test]
    async fn test_explicit_threshold_needs_no_measurement() {
        let (provider, runner) = setup(MockProvider::uniform(100.0));
        let threshold = resolve_threshold(Some(150.0), 0.85, Some(&cluster(4)), &runner)
            .await
            .unwrap();
        assert_eq!(threshold.value_gb_s, 150.0);
        assert_eq!(threshold.source, ThresholdSource::Explicit);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_non_positive_threshold_is_invalid_config() {
        let (provider, runner) = setup(MockProvider::uniform(100.0));
        for bad in [0.0, -1.0] {
            let result = resolve_threshold(Some(bad), 0.85, Some(&cluster(4)), &runner).await;
            assert!(matches!(result, Err(DiagnosisError::InvalidConfig(_))));
        }
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_calibration_takes_exactly_one_measurement() {
        let (provider, runner) = setup(MockProvider::uniform(200.0));
        let group = cluster(8);

        let threshold = resolve_threshold(None, 0.85, Some(&group), &runner)
            .await
            .unwrap();
        assert!((threshold.value_gb_s - 170.0).abs() < 1e-9);
        assert_eq!(provider.calls(), 1);

        // A second resolution reuses the recorded baseline.
        resolve_threshold(None, 0.85, Some(&group), &runner)
            .await
            .unwrap();
        assert_eq!(provider.calls(), 1);
        assert_eq!(runner.history().len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_calibration_leaves_threshold_unavailable() {
        let (provider, runner) = setup(MockProvider::uniform(200.0).with_failing_node("n2"));
        let threshold = resolve_threshold(None, 0.85, Some(&cluster(4)), &runner)
            .await
            .unwrap();
        assert_eq!(threshold.source, ThresholdSource::Unavailable);
        assert_eq!(provider.calls(), 1);

        let history = runner.history().snapshot().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].label, CALIBRATION_LABEL);
        assert!(!history[0].success);
    }

    #[tokio::test]
    async fn test_zero_baseline_leaves_threshold_unavailable() {
        let (_, runner) = setup(MockProvider::uniform(0.0));
        let threshold = resolve_threshold(None, 0.85, Some(&cluster(4)), &runner)
            .await
            .unwrap();
        assert!(!threshold.is_available());
    }

    #[tokio::test]
    async fn test_missing_calibration_group_measures_nothing() {
        let (provider, runner) = setup(MockProvider::uniform(200.0));
        let threshold = resolve_threshold(None, 0.85, None, &runner).await.unwrap();
        assert!(!threshold.is_available());
        assert_eq!(provider.calls(), 0);
    }
}
