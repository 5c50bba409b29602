pub mod cli;
pub mod config;
pub mod diagnosis;
pub mod error;
pub mod export;
pub mod metrics;
pub mod provider;
pub mod store;

pub use cli::Cli;
pub use config::{BisectionStrategy, DiagnosisConfig};
pub use diagnosis::Diagnosis;
pub use error::{DiagnosisError, MeasurementError};
pub use metrics::export_metrics;
pub use metrics::MetricsContext;
pub use provider::{MeasurementProvider, MockProvider, MpiProvider};
pub use store::FileStore;
