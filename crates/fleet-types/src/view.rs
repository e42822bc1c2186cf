//! Boundary shapes exchanged with API callers

use crate::{MasterAction, MasterActionId, MasterActionStatus, NodeAction, OperationType, Parameters};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to start a master action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateRequest {
    pub operation_type: OperationType,
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Parameters,
}

impl InitiateRequest {
    pub fn new(operation_type: OperationType) -> Self {
        Self {
            operation_type,
            description: None,
            parameters: Parameters::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// One stage entry of a status response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageView {
    pub index: usize,
    pub name: String,
    pub is_success: bool,
    /// Synthetic entry for the stage still executing
    pub is_live: bool,
    pub node_actions: Vec<NodeAction>,
}

/// Status response for a master action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterActionView {
    pub id: MasterActionId,
    pub operation_type: OperationType,
    pub name: String,
    pub overall_status: MasterActionStatus,
    pub overall_progress_percent: u8,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub parameters: Parameters,
    pub status_message: Option<String>,
    pub recent_logs: Vec<String>,
    pub stages: Vec<StageView>,
}

impl MasterActionView {
    /// Build a view from a consistent snapshot of the aggregate.
    ///
    /// `live` adds the in-progress stage as a trailing entry that is never
    /// marked successful; archived copies only report completed stages.
    pub fn from_snapshot(action: &MasterAction, live: bool, recent_logs: Vec<String>) -> Self {
        let mut stages: Vec<StageView> = action
            .execution_history
            .iter()
            .map(|record| StageView {
                index: record.stage_index,
                name: record.stage_name.clone(),
                is_success: record.is_success,
                is_live: false,
                node_actions: record.final_node_actions.clone(),
            })
            .collect();

        if live && !action.is_complete() {
            if let Some((index, name)) = action.in_progress_stage() {
                stages.push(StageView {
                    index,
                    name: name.to_string(),
                    is_success: false,
                    is_live: true,
                    node_actions: action.current_stage_node_actions.clone(),
                });
            }
        }

        Self {
            id: action.id.clone(),
            operation_type: action.operation_type.clone(),
            name: action
                .description
                .clone()
                .unwrap_or_else(|| action.operation_type.to_string()),
            overall_status: action.overall_status,
            overall_progress_percent: action.overall_progress_percent,
            start_time: action.start_time,
            end_time: action.end_time,
            parameters: action.parameters.clone(),
            status_message: action.status_message.clone(),
            recent_logs,
            stages,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.overall_status.is_complete()
    }
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    CancellationPending,
    AlreadyCompleted,
    CancellationNotSupported,
    NotFound,
}

/// Response to a cancellation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub operation_id: MasterActionId,
    pub status: CancelOutcome,
    pub message: String,
}

impl CancelResponse {
    pub fn new(operation_id: MasterActionId, status: CancelOutcome, message: impl Into<String>) -> Self {
        Self {
            operation_id,
            status,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeTask, OperationType};

    fn running_action() -> MasterAction {
        let mut action = MasterAction::new(
            MasterActionId::generate(),
            OperationType::ENV_UPDATE_ONLINE,
            Some("nightly update".into()),
            "bob",
            Parameters::new(),
        );
        action.transition_to(MasterActionStatus::Running).unwrap();
        action.open_stage("download");
        action.close_stage(true);
        action.open_stage("install");
        action
            .current_stage_node_actions
            .push(NodeAction::new("install", vec![NodeTask::new("n1", "install")]));
        action
    }

    #[test]
    fn test_live_view_appends_in_progress_stage() {
        let action = running_action();
        let view = MasterActionView::from_snapshot(&action, true, vec![]);
        assert_eq!(view.stages.len(), 2);
        assert!(!view.stages[0].is_live);
        let live = &view.stages[1];
        assert!(live.is_live);
        assert!(!live.is_success);
        assert_eq!(live.index, 1);
        assert_eq!(live.node_actions.len(), 1);
        assert_eq!(view.name, "nightly update");
    }

    #[test]
    fn test_archived_view_has_no_live_entry() {
        let action = running_action();
        let view = MasterActionView::from_snapshot(&action, false, vec![]);
        assert_eq!(view.stages.len(), 1);
    }

    #[test]
    fn test_live_entry_replaced_by_persisted_stage() {
        let mut action = running_action();
        let before = MasterActionView::from_snapshot(&action, true, vec![]).stages.len();
        action.close_stage(true);
        let view = MasterActionView::from_snapshot(&action, true, vec![]);
        assert_eq!(view.stages.len(), before);
        assert!(view.stages.iter().all(|s| !s.is_live));
        assert!(view.stages[1].is_success);
    }
}
