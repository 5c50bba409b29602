use async_trait::async_trait;
use shared::models::{MessageSizePolicy, NodeGroup};

use crate::error::MeasurementError;

pub mod mock;
pub mod mpi;

pub use mock::{MockProfile, MockProvider};
pub use mpi::MpiProvider;

/// Runs a collective bandwidth benchmark over exactly the nodes of a group.
///
/// Implementations may block for minutes. Timeouts are enforced by the caller,
/// so an implementation only has to make sure it can be dropped mid-flight.
#[async_trait]
pub trait MeasurementProvider: Send + Sync {
    /// Returns the achieved bus bandwidth in GB/s.
    async fn measure(
        &self,
        group: &NodeGroup,
        policy: &MessageSizePolicy,
    ) -> Result<f64, MeasurementError>;
}
