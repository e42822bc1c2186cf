//! Handler contract - one implementation per operation type

use crate::context::WorkflowContext;
use crate::error::Result;
use async_trait::async_trait;
use fleet_types::{OperationType, WorkflowOutcome};

/// Implements the stage sequence of one operation type.
///
/// A fresh instance is created for every run. `execute` is expected to poll
/// the context's cancellation token between stages and tasks; returning
/// `Err(ControlError::Cancelled(_))`, typically via `ctx.check_cancelled()?`,
/// ends the run as cancelled. Any other error fails it.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Operation type this handler implements
    fn operation_type(&self) -> OperationType;

    /// Whether cancellation requests are honored
    fn supports_cancellation(&self) -> bool {
        true
    }

    /// Run the workflow to its outcome
    async fn execute(&self, ctx: &WorkflowContext) -> Result<WorkflowOutcome>;
}
