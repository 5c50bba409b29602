pub mod measurement;
pub mod node;
pub mod report;
pub mod suspect;

pub use measurement::{Measurement, MessageSizePolicy, Threshold, ThresholdSource};
pub use node::{NodeGroup, NodeGroupError, NodeId};
pub use report::{DetectionMode, DiagnosisReport, IsolationDecision, IsolationEntry};
pub use suspect::{Confidence, DetectionMethod, SuspectRecord, SuspectStats};
