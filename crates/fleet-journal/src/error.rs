//! Error types for the journal

use fleet_types::{ChangeId, MasterActionId};
use thiserror::Error;

/// Journal error type.
///
/// Every write either becomes durable or returns one of these.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown change: {0}")]
    UnknownChange(ChangeId),

    #[error("change {0} was already finalized")]
    AlreadyFinalized(ChangeId),

    #[error("unknown master action: {0}")]
    UnknownRun(MasterActionId),

    #[error("master action id {0:?} is not a valid path component")]
    InvalidRunId(MasterActionId),

    #[error("master action {id} has no stage {stage_index}")]
    UnknownStage {
        id: MasterActionId,
        stage_index: usize,
    },
}

impl From<serde_json::Error> for JournalError {
    fn from(e: serde_json::Error) -> Self {
        JournalError::Serialization(e.to_string())
    }
}

/// Result type for journal operations
pub type Result<T> = std::result::Result<T, JournalError>;
