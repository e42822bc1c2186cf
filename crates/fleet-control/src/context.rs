//! Workflow Context - Execution environment handed to a handler
//!
//! Bundles the live aggregate behind the shared lock, the cancellation
//! token, the journal and the run logger. Every stage and task mutation goes
//! through here so the coordinator always snapshots a consistent aggregate.

use crate::error::{ControlError, Result};
use crate::logging::{LogFlushFn, RunLogger};
use fleet_journal::Journal;
use fleet_types::{
    MasterAction, MasterActionId, NodeAction, NodeTask, NodeTaskStatus, OperationType, Parameters,
    StageRecord, TaskId,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Per-run context passed to [`Handler::execute`](crate::Handler::execute)
pub struct WorkflowContext {
    id: MasterActionId,
    operation_type: OperationType,
    parameters: Parameters,
    initiated_by: String,
    action: Arc<Mutex<MasterAction>>,
    cancellation: CancellationToken,
    journal: Journal,
    logger: Arc<RunLogger>,
    flush: LogFlushFn,
}

impl WorkflowContext {
    pub(crate) fn new(
        action: Arc<Mutex<MasterAction>>,
        snapshot: &MasterAction,
        cancellation: CancellationToken,
        journal: Journal,
        logger: Arc<RunLogger>,
    ) -> Self {
        let flush = logger.flush_callback();
        Self {
            id: snapshot.id.clone(),
            operation_type: snapshot.operation_type.clone(),
            parameters: snapshot.parameters.clone(),
            initiated_by: snapshot.initiated_by.clone(),
            action,
            cancellation,
            journal,
            logger,
            flush,
        }
    }

    pub fn id(&self) -> &MasterActionId {
        &self.id
    }

    pub fn operation_type(&self) -> &OperationType {
        &self.operation_type
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Typed view of one request parameter
    pub fn parameter<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.parameters.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn initiated_by(&self) -> &str {
        &self.initiated_by
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn logger(&self) -> &RunLogger {
        &self.logger
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            Err(ControlError::Cancelled("cancellation requested".to_string()))
        } else {
            Ok(())
        }
    }

    /// Drain buffered log lines into the action journal
    pub async fn flush_logs(&self) -> Result<()> {
        (self.flush)().await
    }

    /// Consistent copy of the aggregate
    pub async fn snapshot(&self) -> MasterAction {
        self.action.lock().await.clone()
    }

    /// Open the next stage and journal its input
    #[instrument(skip(self, input), fields(master_action_id = %self.id))]
    pub async fn begin_stage(&self, name: &str, input: impl Serialize) -> Result<usize> {
        let input = serde_json::to_value(input)?;
        let index = {
            let mut action = self.action.lock().await;
            if let Some((open, _)) = action.in_progress_stage() {
                return Err(ControlError::StageInProgress(open));
            }
            let index = action.next_stage_index();
            self.journal
                .actions()
                .record_stage_started(&self.id, index, name, input)
                .await?;
            action.open_stage(name);
            index
        };

        self.logger.set_stage(Some(index));
        self.logger
            .info(format!("Stage {} '{}' started", index, name))
            .await;
        Ok(index)
    }

    /// Create a node action for the open stage with one task per target.
    ///
    /// Targets are `(node_name, task_type)` pairs. The node action id is
    /// registered so agent output carrying it is filed under this stage.
    pub async fn dispatch_node_action<I, N, T>(&self, name: &str, targets: I) -> Result<NodeAction>
    where
        I: IntoIterator<Item = (N, T)>,
        N: Into<String>,
        T: Into<String>,
    {
        let tasks: Vec<NodeTask> = targets
            .into_iter()
            .map(|(node, task_type)| NodeTask::new(node, task_type))
            .collect();
        let node_action = NodeAction::new(name, tasks);

        let mut action = self.action.lock().await;
        let (stage_index, _) = action
            .in_progress_stage()
            .ok_or(ControlError::NoActiveStage)?;
        self.journal
            .actions()
            .register_node_action(&self.id, &node_action.id, stage_index)
            .await?;
        action.current_stage_node_actions.push(node_action.clone());

        debug!(
            master_action_id = %self.id,
            node_action_id = %node_action.id,
            stage_index,
            tasks = node_action.tasks.len(),
            "Node action dispatched"
        );
        Ok(node_action)
    }

    /// Record progress of one node task of the open stage
    pub async fn update_node_task(
        &self,
        task_id: &TaskId,
        status: NodeTaskStatus,
        message: Option<String>,
        payload: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut action = self.action.lock().await;
        let task = action
            .find_task_mut(task_id)
            .ok_or_else(|| ControlError::UnknownTask(task_id.clone()))?;
        task.status = status;
        if status.is_terminal() {
            debug!(master_action_id = %self.id, task_id = %task_id, ?status, "Node task finished");
        }
        if message.is_some() {
            task.status_message = message;
        }
        if payload.is_some() {
            task.result_payload = payload;
        }
        Ok(())
    }

    /// Close the open stage, journal its result and checkpoint the aggregate
    #[instrument(skip(self, result), fields(master_action_id = %self.id))]
    pub async fn complete_stage(&self, is_success: bool, result: impl Serialize) -> Result<StageRecord> {
        let result = serde_json::to_value(result)?;
        let record = {
            let mut action = self.action.lock().await;
            let (index, _) = action
                .in_progress_stage()
                .ok_or(ControlError::NoActiveStage)?;
            self.journal
                .actions()
                .record_stage_result(&self.id, index, is_success, result)
                .await?;
            let record = action.close_stage(is_success).ok_or(ControlError::NoActiveStage)?;
            self.journal.actions().record_checkpoint(&action).await?;
            record
        };

        self.logger
            .info(format!(
                "Stage {} '{}' {}",
                record.stage_index,
                record.stage_name,
                if is_success { "succeeded" } else { "failed" }
            ))
            .await;
        self.logger.set_stage(None);
        Ok(record)
    }

    pub async fn set_progress(&self, percent: u8) {
        self.action.lock().await.set_progress(percent);
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("id", &self.id)
            .field("operation_type", &self.operation_type)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use fleet_journal::JournalConfig;
    use fleet_types::MasterActionStatus;

    async fn context(dir: &tempfile::TempDir) -> WorkflowContext {
        let journal = Journal::open(&JournalConfig {
            root: dir.path().to_path_buf(),
            sync_writes: false,
            recover_on_open: false,
        })
        .await
        .unwrap();
        let mut action = MasterAction::new(
            MasterActionId::generate(),
            OperationType::ENV_UPDATE_ONLINE,
            None,
            "carol",
            Parameters::new(),
        );
        action.transition_to(MasterActionStatus::Running).unwrap();
        journal.actions().record_initiated(&action).await.unwrap();

        let logger = Arc::new(RunLogger::new(action.id.clone(), journal.clone(), &CoordinatorConfig::default()));
        let snapshot = action.clone();
        WorkflowContext::new(
            Arc::new(Mutex::new(action)),
            &snapshot,
            CancellationToken::new(),
            journal,
            logger,
        )
    }

    #[tokio::test]
    async fn test_stage_flow() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;

        let index = ctx.begin_stage("download", serde_json::json!({"version": "2.1"})).await.unwrap();
        assert_eq!(index, 0);
        assert!(matches!(
            ctx.begin_stage("again", ()).await,
            Err(ControlError::StageInProgress(0))
        ));

        let na = ctx
            .dispatch_node_action("fetch", vec![("node-1", "download"), ("node-2", "download")])
            .await
            .unwrap();
        assert_eq!(
            ctx.journal().translator().translate_node_action_id_to_master_action_id(&na.id),
            Some(ctx.id().clone())
        );

        let task_id = na.tasks[0].task_id.clone();
        ctx.update_node_task(&task_id, NodeTaskStatus::Succeeded, Some("ok".into()), None)
            .await
            .unwrap();

        let record = ctx.complete_stage(true, serde_json::json!({"fetched": 2})).await.unwrap();
        assert_eq!(record.final_node_actions[0].tasks[0].status, NodeTaskStatus::Succeeded);

        let snapshot = ctx.snapshot().await;
        assert_eq!(snapshot.execution_history.len(), 1);
        assert!(snapshot.in_progress_stage().is_none());

        let archived = ctx
            .journal()
            .actions()
            .get_archived_master_action(ctx.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(archived.execution_history.len(), 1);
    }

    #[tokio::test]
    async fn test_stage_operations_need_open_stage() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;

        assert!(matches!(
            ctx.dispatch_node_action("x", Vec::<(String, String)>::new()).await,
            Err(ControlError::NoActiveStage)
        ));
        assert!(matches!(ctx.complete_stage(true, ()).await, Err(ControlError::NoActiveStage)));
        assert!(matches!(
            ctx.update_node_task(&TaskId::new("task-x"), NodeTaskStatus::Running, None, None).await,
            Err(ControlError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn test_check_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancellation_token().cancel();
        assert!(ctx.check_cancelled().unwrap_err().is_cancelled());
    }
}
