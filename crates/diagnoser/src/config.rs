use serde::{Deserialize, Serialize};
use shared::models::{DetectionMode, MessageSizePolicy};
use std::fmt;
use std::time::Duration;

use crate::diagnosis::statistics::OutlierConfig;
use crate::error::{DiagnosisError, Result};

pub const DEFAULT_SAFETY_MARGIN: f64 = 0.85;
pub const DEFAULT_SIGMA_THRESHOLD: f64 = 2.0;
pub const DEFAULT_IQR_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_FAILURE_RATE_THRESHOLD: f64 = 0.5;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SLOTS_PER_NODE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BisectionStrategy {
    /// Split every failing group and test both halves; finds every bad node.
    #[default]
    Exhaustive,
    /// Assume one bad node per failing group and follow a single path down.
    BinarySearch,
}

impl fmt::Display for BisectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BisectionStrategy::Exhaustive => write!(f, "exhaustive"),
            BisectionStrategy::BinarySearch => write!(f, "binary-search"),
        }
    }
}

/// Immutable parameters of a single diagnosis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisConfig {
    pub mode: DetectionMode,
    /// Fixed bandwidth floor in GB/s; auto-calibrated when absent.
    pub threshold_gb_s: Option<f64>,
    /// Fraction of the calibration baseline used as the threshold.
    pub safety_margin: f64,
    pub sigma_threshold: f64,
    pub iqr_multiplier: f64,
    /// A node is flagged when more than this fraction of its pairs fail.
    pub failure_rate_threshold: f64,
    pub max_pairs: Option<usize>,
    pub pair_seed: Option<u64>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub strategy: BisectionStrategy,
    pub parallelism: usize,
    pub slots_per_node: u32,
    pub message_policy: MessageSizePolicy,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::default(),
            threshold_gb_s: None,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            sigma_threshold: DEFAULT_SIGMA_THRESHOLD,
            iqr_multiplier: DEFAULT_IQR_MULTIPLIER,
            failure_rate_threshold: DEFAULT_FAILURE_RATE_THRESHOLD,
            max_pairs: None,
            pair_seed: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            strategy: BisectionStrategy::default(),
            parallelism: 1,
            slots_per_node: DEFAULT_SLOTS_PER_NODE,
            message_policy: MessageSizePolicy::default(),
        }
    }
}

impl DiagnosisConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(threshold) = self.threshold_gb_s {
            if !threshold.is_finite() || threshold <= 0.0 {
                return Err(DiagnosisError::InvalidConfig(format!(
                    "threshold must be a positive number of GB/s, got {threshold}"
                )));
            }
        }
        if !(self.safety_margin > 0.0 && self.safety_margin <= 1.0) {
            return Err(DiagnosisError::InvalidConfig(format!(
                "safety margin must be in (0, 1], got {}",
                self.safety_margin
            )));
        }
        OutlierConfig::from(self).validate()?;
        if !(0.0..1.0).contains(&self.failure_rate_threshold) {
            return Err(DiagnosisError::InvalidConfig(format!(
                "failure rate threshold must be in [0, 1), got {}",
                self.failure_rate_threshold
            )));
        }
        if self.max_pairs == Some(0) {
            return Err(DiagnosisError::InvalidConfig(
                "max pairs must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(DiagnosisError::InvalidConfig(
                "measurement timeout must be non-zero".to_string(),
            ));
        }
        if self.parallelism == 0 {
            return Err(DiagnosisError::InvalidConfig(
                "parallelism must be at least 1".to_string(),
            ));
        }
        if self.slots_per_node == 0 {
            return Err(DiagnosisError::InvalidConfig(
                "slots per node must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DiagnosisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.safety_margin, 0.85);
        assert_eq!(config.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_rejects_non_positive_threshold() {
        for bad in [0.0, -10.0, f64::NAN, f64::INFINITY] {
            let config = DiagnosisConfig {
                threshold_gb_s: Some(bad),
                ..Default::default()
            };
            assert!(matches!(
                config.validate(),
                Err(DiagnosisError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_rejects_out_of_range_parameters() {
        let cases = [
            DiagnosisConfig {
                safety_margin: 1.5,
                ..Default::default()
            },
            DiagnosisConfig {
                failure_rate_threshold: 1.0,
                ..Default::default()
            },
            DiagnosisConfig {
                max_pairs: Some(0),
                ..Default::default()
            },
            DiagnosisConfig {
                parallelism: 0,
                ..Default::default()
            },
            DiagnosisConfig {
                timeout: Duration::ZERO,
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(config.validate().is_err(), "accepted {config:?}");
        }
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = DiagnosisConfig {
            mode: DetectionMode::Both,
            timeout: Duration::from_millis(1500),
            strategy: BisectionStrategy::BinarySearch,
            ..Default::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["timeout"], 1.5);
        assert_eq!(json["strategy"], "binary-search");
        let back: DiagnosisConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
