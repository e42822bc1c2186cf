//! Error types for the control plane

use fleet_journal::JournalError;
use fleet_types::{InvalidTransition, MasterActionId, OperationType, TaskId};
use thiserror::Error;

/// Control plane error type
#[derive(Debug, Error)]
pub enum ControlError {
    /// Another master action holds the single-flight lock
    #[error("Concurrency conflict: {}", running_description(.running))]
    ConcurrencyConflict { running: Option<MasterActionId> },

    /// No handler registered for the operation type
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(OperationType),

    /// A handler was registered twice for one operation type
    #[error("Duplicate handler for operation {0}")]
    DuplicateHandler(OperationType),

    /// A factory produced a handler for a different operation type
    #[error("Handler registered for {registered} implements {reported}")]
    HandlerMismatch {
        registered: OperationType,
        reported: OperationType,
    },

    /// Cooperative cancellation observed by the handler
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Journal subsystem error
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    /// Status transition rejected by the state machine
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Stage operation without an open stage
    #[error("No stage in progress")]
    NoActiveStage,

    /// A stage was opened while another was still in progress
    #[error("Stage {0} is still in progress")]
    StageInProgress(usize),

    /// Task update for a task not in the current stage
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    /// Payload could not be serialized for the journal
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Failure raised by a handler
    #[error("Handler failed: {0}")]
    Handler(String),
}

fn running_description(running: &Option<MasterActionId>) -> String {
    match running {
        Some(id) => format!("master action {} is already running", id),
        None => "a master action is already running".to_string(),
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        ControlError::Serialization(e.to_string())
    }
}

impl ControlError {
    /// Create a handler failure from any message
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ControlError::Cancelled(_))
    }
}

/// Result type for control plane operations
pub type Result<T> = std::result::Result<T, ControlError>;
