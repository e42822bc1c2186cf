//! Master action types
//!
//! A MasterAction is one orchestrated workflow. It moves through stages,
//! each of which dispatches node actions to the fleet and ends up as an
//! immutable [`StageRecord`] in the execution history.

use crate::{MasterActionId, NodeActionId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Free-form operation parameters supplied by the initiator
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Key identifying which handler executes a master action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationType(Cow<'static, str>);

impl OperationType {
    pub const ENV_UPDATE_ONLINE: OperationType = OperationType(Cow::Borrowed("EnvUpdateOnline"));
    pub const ENV_UPDATE_OFFLINE: OperationType =
        OperationType(Cow::Borrowed("EnvUpdateOffline"));
    pub const ENV_BACKUP: OperationType = OperationType(Cow::Borrowed("EnvBackup"));
    pub const ENV_RESTORE: OperationType = OperationType(Cow::Borrowed("EnvRestore"));
    pub const DIAGNOSTICS: OperationType = OperationType(Cow::Borrowed("Diagnostics"));
    pub const PACKAGE_CHANGE: OperationType = OperationType(Cow::Borrowed("PackageChange"));

    pub fn new(key: impl Into<String>) -> Self {
        Self(Cow::Owned(key.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationType {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Overall status of a master action.
///
/// `Initiated -> Running -> {Completed, Failed, Cancelling -> Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MasterActionStatus {
    Initiated,
    Running,
    /// Cancellation requested, handler has not unwound yet
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl MasterActionStatus {
    /// True iff the status is terminal
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check whether moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: MasterActionStatus) -> bool {
        use MasterActionStatus::*;
        match (self, next) {
            (Initiated, Running | Failed | Cancelled) => true,
            (Running, Completed | Failed | Cancelling | Cancelled) => true,
            // A handler may finish its last stage before it observes the token
            (Cancelling, Cancelled | Failed | Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MasterActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initiated => "Initiated",
            Self::Running => "Running",
            Self::Cancelling => "Cancelling",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Rejected status transition
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: MasterActionStatus,
    pub to: MasterActionStatus,
}

/// Explicit terminal outcome reported by a handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowOutcome {
    Success,
    Failed(String),
    Cancelled(String),
}

impl WorkflowOutcome {
    /// Status the aggregate ends in for this outcome
    pub fn terminal_status(&self) -> MasterActionStatus {
        match self {
            Self::Success => MasterActionStatus::Completed,
            Self::Failed(_) => MasterActionStatus::Failed,
            Self::Cancelled(_) => MasterActionStatus::Cancelled,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::Failed(reason) | Self::Cancelled(reason) => Some(reason),
        }
    }
}

/// Status of a task on a single node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeTaskStatus {
    Pending,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl NodeTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

/// Unit of work on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTask {
    pub node_name: String,
    /// Globally unique; join key for late-arriving node output
    pub task_id: TaskId,
    pub task_type: String,
    pub status: NodeTaskStatus,
    pub status_message: Option<String>,
    pub result_payload: Option<serde_json::Value>,
}

impl NodeTask {
    pub fn new(node_name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            task_id: TaskId::generate(),
            task_type: task_type.into(),
            status: NodeTaskStatus::Pending,
            status_message: None,
            result_payload: None,
        }
    }
}

/// A stage's sub-action directed at the fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAction {
    pub id: NodeActionId,
    pub name: String,
    pub tasks: Vec<NodeTask>,
}

impl NodeAction {
    pub fn new(name: impl Into<String>, tasks: Vec<NodeTask>) -> Self {
        Self {
            id: NodeActionId::generate(),
            name: name.into(),
            tasks,
        }
    }
}

/// Immutable record of a finished stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage_index: usize,
    pub stage_name: String,
    pub is_success: bool,
    /// Node actions as they stood when the stage finished
    pub final_node_actions: Vec<NodeAction>,
}

/// One orchestrated workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterAction {
    pub id: MasterActionId,
    pub operation_type: OperationType,
    pub description: Option<String>,
    pub initiated_by: String,
    pub parameters: Parameters,
    pub overall_status: MasterActionStatus,
    /// 0-100
    pub overall_progress_percent: u8,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Append-only
    pub execution_history: Vec<StageRecord>,
    pub current_stage_index: Option<usize>,
    pub current_stage_name: Option<String>,
    pub current_stage_node_actions: Vec<NodeAction>,
    /// Failure or cancellation reason
    pub status_message: Option<String>,
    pub cancellation_requested_by: Option<String>,
}

impl MasterAction {
    /// Create a new aggregate in `Initiated` status
    pub fn new(
        id: MasterActionId,
        operation_type: OperationType,
        description: Option<String>,
        initiated_by: impl Into<String>,
        parameters: Parameters,
    ) -> Self {
        Self {
            id,
            operation_type,
            description,
            initiated_by: initiated_by.into(),
            parameters,
            overall_status: MasterActionStatus::Initiated,
            overall_progress_percent: 0,
            start_time: Utc::now(),
            end_time: None,
            execution_history: Vec::new(),
            current_stage_index: None,
            current_stage_name: None,
            current_stage_node_actions: Vec::new(),
            status_message: None,
            cancellation_requested_by: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.overall_status.is_complete()
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition_to(&mut self, next: MasterActionStatus) -> Result<(), InvalidTransition> {
        if !self.overall_status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.overall_status,
                to: next,
            });
        }
        self.overall_status = next;
        Ok(())
    }

    /// Index and name of the stage currently executing, if any
    pub fn in_progress_stage(&self) -> Option<(usize, &str)> {
        match (self.current_stage_index, self.current_stage_name.as_deref()) {
            (Some(index), Some(name)) => Some((index, name)),
            _ => None,
        }
    }

    /// Index the next stage will get
    pub fn next_stage_index(&self) -> usize {
        self.execution_history.len()
    }

    /// Open a new stage
    pub fn open_stage(&mut self, name: impl Into<String>) -> usize {
        let index = self.next_stage_index();
        self.current_stage_index = Some(index);
        self.current_stage_name = Some(name.into());
        self.current_stage_node_actions.clear();
        index
    }

    /// Close the open stage, appending it to the execution history.
    ///
    /// Returns `None` when no stage is open.
    pub fn close_stage(&mut self, is_success: bool) -> Option<StageRecord> {
        let index = self.current_stage_index.take()?;
        let name = self.current_stage_name.take().unwrap_or_default();
        let record = StageRecord {
            stage_index: index,
            stage_name: name,
            is_success,
            final_node_actions: std::mem::take(&mut self.current_stage_node_actions),
        };
        self.execution_history.push(record.clone());
        Some(record)
    }

    pub fn find_task_mut(&mut self, task_id: &TaskId) -> Option<&mut NodeTask> {
        self.current_stage_node_actions
            .iter_mut()
            .flat_map(|a| a.tasks.iter_mut())
            .find(|t| &t.task_id == task_id)
    }

    pub fn set_progress(&mut self, percent: u8) {
        self.overall_progress_percent = percent.min(100);
    }

    /// Put the aggregate into its terminal status.
    ///
    /// A stage left open is closed, successful only if the run completed.
    /// Finishing an already terminal action is a no-op and returns false.
    pub fn finish(&mut self, status: MasterActionStatus, message: Option<String>) -> bool {
        if self.is_complete() || !status.is_complete() {
            return false;
        }
        if self.in_progress_stage().is_some() {
            self.close_stage(status == MasterActionStatus::Completed);
        }
        self.overall_status = status;
        if status == MasterActionStatus::Completed {
            self.overall_progress_percent = 100;
        }
        if message.is_some() {
            self.status_message = message;
        }
        self.end_time = Some(Utc::now());
        true
    }
}
