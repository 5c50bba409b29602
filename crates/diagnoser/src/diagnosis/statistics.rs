use log::debug;
use serde::{Deserialize, Serialize};
use shared::models::{Confidence, DetectionMethod, NodeId, SuspectRecord, SuspectStats};

use crate::config::{DiagnosisConfig, DEFAULT_IQR_MULTIPLIER, DEFAULT_SIGMA_THRESHOLD};
use crate::error::{DiagnosisError, Result};

const MIN_ZSCORE_SAMPLES: usize = 3;
const MIN_IQR_SAMPLES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierConfig {
    pub sigma_threshold: f64,
    pub iqr_multiplier: f64,
    /// Only report values below the bulk of the samples.
    pub low_side_only: bool,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            sigma_threshold: DEFAULT_SIGMA_THRESHOLD,
            iqr_multiplier: DEFAULT_IQR_MULTIPLIER,
            low_side_only: false,
        }
    }
}

impl OutlierConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.sigma_threshold.is_finite() || self.sigma_threshold <= 0.0 {
            return Err(DiagnosisError::InvalidConfig(format!(
                "sigma threshold must be positive, got {}",
                self.sigma_threshold
            )));
        }
        if !self.iqr_multiplier.is_finite() || self.iqr_multiplier <= 0.0 {
            return Err(DiagnosisError::InvalidConfig(format!(
                "IQR multiplier must be positive, got {}",
                self.iqr_multiplier
            )));
        }
        Ok(())
    }
}

impl From<&DiagnosisConfig> for OutlierConfig {
    fn from(config: &DiagnosisConfig) -> Self {
        Self {
            sigma_threshold: config.sigma_threshold,
            iqr_multiplier: config.iqr_multiplier,
            low_side_only: false,
        }
    }
}

/// Descriptive statistics of a bandwidth sample set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub coefficient_of_variation: f64,
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let mean = mean(values)?;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Percentile `p` in `[0, 100]` of ascending `sorted`, interpolating linearly
/// between the closest ranks.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

pub fn summarize(values: &[f64]) -> Option<Summary> {
    let mean = mean(values)?;
    let std_dev = std_dev(values)?;
    let sorted = sorted(values);
    Some(Summary {
        count: values.len(),
        mean,
        median: percentile(&sorted, 50.0)?,
        std_dev,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        coefficient_of_variation: if mean > 0.0 { std_dev / mean } else { 0.0 },
    })
}

/// Flags outliers among per-node bandwidth samples by z-score and by IQR fence.
///
/// Emits one record per method that flags a node; a node flagged by both
/// methods gets high confidence on both records, otherwise medium. Z-score
/// needs at least 3 samples and a non-zero spread, IQR at least 4 samples.
pub fn detect_outliers(samples: &[(NodeId, f64)], config: &OutlierConfig) -> Vec<SuspectRecord> {
    let values: Vec<f64> = samples.iter().map(|(_, value)| *value).collect();

    let zscore = match (mean(&values), std_dev(&values)) {
        (Some(mean), Some(std)) if values.len() >= MIN_ZSCORE_SAMPLES && std > 0.0 => {
            debug!("Z-score detection: mean={mean:.2}, std={std:.2}");
            Some((mean, std))
        }
        _ => None,
    };

    let fence = if values.len() >= MIN_IQR_SAMPLES {
        let sorted = sorted(&values);
        match (percentile(&sorted, 25.0), percentile(&sorted, 75.0)) {
            (Some(q1), Some(q3)) => {
                let iqr = q3 - q1;
                debug!("IQR detection: Q1={q1:.2}, Q3={q3:.2}, IQR={iqr:.2}");
                Some((
                    q1 - config.iqr_multiplier * iqr,
                    q3 + config.iqr_multiplier * iqr,
                ))
            }
            _ => None,
        }
    } else {
        None
    };

    let mut records = Vec::new();
    for (node, value) in samples {
        let z = zscore.map(|(mean, std)| (value - mean) / std);
        let by_zscore = z.is_some_and(|z| z.abs() > config.sigma_threshold);
        let by_iqr = fence.is_some_and(|(low, high)| *value < low || *value > high);
        if config.low_side_only && zscore.is_some_and(|(mean, _)| *value >= mean) {
            continue;
        }

        let confidence = if by_zscore && by_iqr {
            Confidence::High
        } else {
            Confidence::Medium
        };
        let stats = SuspectStats {
            measured_bandwidth_gb_s: Some(*value),
            z_score: z,
            ..Default::default()
        };

        if let (true, Some((mean, _)), Some(z)) = (by_zscore, zscore, z) {
            records.push(
                SuspectRecord::new(
                    node.clone(),
                    DetectionMethod::Zscore,
                    confidence,
                    format!(
                        "bandwidth {value:.2} GB/s is {:.2} sigma from mean {mean:.2} GB/s",
                        z.abs()
                    ),
                )
                .with_stats(stats.clone()),
            );
        }
        if let (true, Some((low, high))) = (by_iqr, fence) {
            records.push(
                SuspectRecord::new(
                    node.clone(),
                    DetectionMethod::Iqr,
                    confidence,
                    format!("bandwidth {value:.2} GB/s outside IQR fence [{low:.2}, {high:.2}] GB/s"),
                )
                .with_stats(stats),
            );
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(values: &[f64]) -> Vec<(NodeId, f64)> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (NodeId::from(format!("n{i}")), *v))
            .collect()
    }

    #[test]
    fn test_outlier_config_rejects_non_positive_parameters() {
        assert!(OutlierConfig::default().validate().is_ok());
        for (sigma_threshold, iqr_multiplier) in [(-2.0, 1.5), (0.0, 1.5), (2.0, -1.0), (f64::NAN, 1.5)] {
            let config = OutlierConfig {
                sigma_threshold,
                iqr_multiplier,
                low_side_only: false,
            };
            assert!(matches!(
                config.validate(),
                Err(DiagnosisError::InvalidConfig(_))
            ));
        }
    }

    const TIGHT: [f64; 10] = [100.0, 101.0, 99.0, 100.5, 99.5, 100.0, 101.0, 99.0, 100.2, 99.8];

    #[test]
    fn test_single_outlier_flagged_by_both_methods() {
        let mut values = TIGHT.to_vec();
        values.push(50.0);
        let records = detect_outliers(&samples(&values), &OutlierConfig::default());

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.node.as_str() == "n10"));
        assert!(records.iter().all(|r| r.confidence == Confidence::High));
        assert_eq!(records[0].method, DetectionMethod::Zscore);
        assert_eq!(records[1].method, DetectionMethod::Iqr);
        assert!(records[0].stats.z_score.unwrap() < -3.0);
        assert_eq!(records[0].stats.measured_bandwidth_gb_s, Some(50.0));
    }

    #[test]
    fn test_identical_samples_have_no_outliers() {
        let records = detect_outliers(&samples(&[80.0; 6]), &OutlierConfig::default());
        assert!(records.is_empty());
    }

    #[test]
    fn test_minimum_sample_counts() {
        // Two samples: neither method applies.
        assert!(detect_outliers(&samples(&[100.0, 10.0]), &OutlierConfig::default()).is_empty());

        // Three samples: z-score only, and |z| can never exceed sqrt(2) here.
        let three = detect_outliers(&samples(&[100.0, 100.0, 10.0]), &OutlierConfig::default());
        assert!(three.is_empty());
        let loose = OutlierConfig {
            sigma_threshold: 1.0,
            ..Default::default()
        };
        let three = detect_outliers(&samples(&[100.0, 100.0, 10.0]), &loose);
        assert_eq!(three.len(), 1);
        assert_eq!(three[0].method, DetectionMethod::Zscore);
        assert_eq!(three[0].confidence, Confidence::Medium);
    }

    #[test]
    fn test_low_side_only_skips_fast_nodes() {
        let mut values = TIGHT.to_vec();
        values.push(150.0);
        let both_sides = detect_outliers(&samples(&values), &OutlierConfig::default());
        assert!(!both_sides.is_empty());

        let low_only = OutlierConfig {
            low_side_only: true,
            ..Default::default()
        };
        assert!(detect_outliers(&samples(&values), &low_only).is_empty());
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 25.0), Some(1.75));
        assert_eq!(percentile(&sorted, 50.0), Some(2.5));
        assert_eq!(percentile(&sorted, 100.0), Some(4.0));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_summary() {
        let summary = summarize(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(summary.count, 8);
        assert_eq!(summary.mean, 5.0);
        assert_eq!(summary.std_dev, 2.0);
        assert_eq!(summary.median, 4.5);
        assert_eq!(summary.min, 2.0);
        assert_eq!(summary.max, 9.0);
        assert_eq!(summary.coefficient_of_variation, 0.4);
        assert!(summarize(&[]).is_none());
    }
}
