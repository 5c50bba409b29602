use shared::models::NodeGroupError;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, DiagnosisError>;

/// Run-level failures. Anything here stops a diagnosis before or instead of
/// producing a report.
#[derive(Debug, thiserror::Error)]
pub enum DiagnosisError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("node set is empty")]
    EmptyGroup,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<NodeGroupError> for DiagnosisError {
    fn from(err: NodeGroupError) -> Self {
        DiagnosisError::InvalidConfig(err.to_string())
    }
}

/// Per-measurement failures. These are recorded on the measurement and
/// treated as a failing result; they never abort a run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeasurementError {
    #[error("measurement timed out after {}s", .0.as_secs_f64())]
    ProviderTimeout(Duration),

    #[error("provider error: {0}")]
    ProviderError(String),
}
