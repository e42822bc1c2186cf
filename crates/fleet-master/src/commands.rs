//! fleetd commands - journal inspection and recovery

use crate::config::MasterConfig;
use anyhow::{anyhow, Context};
use clap::Subcommand;
use fleet_control::{HandlerRegistry, MasterActionCoordinator};
use fleet_journal::{Journal, JournalConfig};
use fleet_types::{ChangeOutcome, ChangeQuery, ChangeSortField, ChangeType, MasterActionId};
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List change journal entries
    Changes {
        /// Only changes of this type
        #[arg(long = "type")]
        change_type: Option<ChangeType>,

        /// Only changes with this outcome
        #[arg(long)]
        outcome: Option<ChangeOutcome>,

        /// Free-text match on the description
        #[arg(long)]
        text: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long, default_value_t = 20)]
        page_size: usize,

        /// Oldest first
        #[arg(long)]
        ascending: bool,
    },

    /// Most recent successful change of a type
    LastSuccess {
        change_type: ChangeType,
    },

    /// Recent master action runs
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Full record of one run: snapshot, stages, inputs, results, log sources
    Run {
        id: String,
    },

    /// Status view of one run, as returned to API callers
    Status {
        id: String,
    },

    /// Raw log text of one stage
    StageLog {
        id: String,
        stage_index: usize,
    },

    /// Close out records left open by a crashed master
    Recover,
}

/// Run `command` against the journal configured in `config`
pub async fn execute(command: Command, config: &MasterConfig) -> anyhow::Result<Value> {
    // Only `recover` closes out open records
    let journal_config = JournalConfig {
        recover_on_open: false,
        ..config.journal.clone()
    };
    let journal = Journal::open(&journal_config)
        .await
        .with_context(|| format!("opening journal at {}", journal_config.root.display()))?;

    match command {
        Command::Changes {
            change_type,
            outcome,
            text,
            page,
            page_size,
            ascending,
        } => {
            let mut builder = ChangeQuery::builder()
                .sort_by(ChangeSortField::InitiatedAt, !ascending)
                .page(page, page_size);
            if let Some(change_type) = change_type {
                builder = builder.change_type(change_type);
            }
            if let Some(outcome) = outcome {
                builder = builder.outcome(outcome);
            }
            if let Some(text) = text {
                builder = builder.text(text);
            }
            let page = journal.changes().list_changes(&builder.build()).await?;
            Ok(serde_json::to_value(page)?)
        }

        Command::LastSuccess { change_type } => {
            let change = journal
                .changes()
                .latest_successful(change_type)
                .await?
                .ok_or_else(|| anyhow!("no successful {} change recorded", change_type))?;
            let result = journal.changes().read_result(&change.change_id).await?;
            Ok(json!({ "change": change, "result": result }))
        }

        Command::Runs { limit } => Ok(serde_json::to_value(journal.actions().list_runs(limit).await?)?),

        Command::Run { id } => {
            let id = MasterActionId::new(id);
            let details = journal
                .actions()
                .get_run(&id)
                .await?
                .ok_or_else(|| anyhow!("master action {} not found", id))?;
            Ok(serde_json::to_value(details)?)
        }

        Command::Status { id } => {
            let id = MasterActionId::new(id);
            let coordinator =
                MasterActionCoordinator::new(HandlerRegistry::default(), journal, config.coordinator.clone());
            let view = coordinator
                .status(&id)
                .await?
                .ok_or_else(|| anyhow!("master action {} not found", id))?;
            Ok(serde_json::to_value(view)?)
        }

        Command::StageLog { id, stage_index } => {
            let id = MasterActionId::new(id);
            let log = journal
                .actions()
                .get_stage_logs(&id, stage_index)
                .await?
                .ok_or_else(|| anyhow!("master action {} has no stage {}", id, stage_index))?;
            Ok(json!({ "master_action_id": id, "stage_index": stage_index, "log": log }))
        }

        Command::Recover => {
            let report = journal.recover().await?;
            info!(
                changes = report.changes.len(),
                runs = report.runs.len(),
                "Recovery finished"
            );
            Ok(serde_json::to_value(report)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::{
        MasterAction, MasterActionStatus, OperationType, Parameters, StateChangeFinalization, StateChangeRequest,
    };

    fn config(dir: &tempfile::TempDir) -> MasterConfig {
        let mut config = MasterConfig::default();
        config.journal = JournalConfig {
            root: dir.path().to_path_buf(),
            sync_writes: false,
            recover_on_open: true,
        };
        config
    }

    async fn seed(config: &MasterConfig) -> (MasterActionId, MasterActionId) {
        let journal = Journal::open(&JournalConfig {
            recover_on_open: false,
            ..config.journal.clone()
        })
        .await
        .unwrap();

        let handle = journal
            .changes()
            .initiate_state_change(StateChangeRequest::new(ChangeType::Update, "update to 3.0"))
            .await
            .unwrap();
        journal
            .changes()
            .finalize_state_change(StateChangeFinalization::new(
                handle.change_id,
                ChangeOutcome::Success,
                json!({ "manifest": ["core@3.0"] }),
            ))
            .await
            .unwrap();

        let mut done = MasterAction::new(
            MasterActionId::generate(),
            OperationType::ENV_UPDATE_ONLINE,
            None,
            "ops",
            Parameters::new(),
        );
        done.transition_to(MasterActionStatus::Running).unwrap();
        journal.actions().record_initiated(&done).await.unwrap();
        journal
            .actions()
            .record_stage_started(&done.id, 0, "install", Value::Null)
            .await
            .unwrap();
        done.open_stage("install");
        done.finish(MasterActionStatus::Completed, None);
        journal.actions().record_completed(&done).await.unwrap();

        let mut open = MasterAction::new(
            MasterActionId::generate(),
            OperationType::ENV_BACKUP,
            None,
            "ops",
            Parameters::new(),
        );
        open.transition_to(MasterActionStatus::Running).unwrap();
        journal.actions().record_initiated(&open).await.unwrap();

        (done.id, open.id)
    }

    #[tokio::test]
    async fn test_inspection_does_not_recover() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (done, open) = seed(&config).await;

        let runs = execute(Command::Runs { limit: 10 }, &config).await.unwrap();
        assert_eq!(runs.as_array().unwrap().len(), 2);

        let status = execute(Command::Status { id: open.to_string() }, &config)
            .await
            .unwrap();
        assert_eq!(status["overall_status"], "Running");

        let run = execute(Command::Run { id: done.to_string() }, &config).await.unwrap();
        assert_eq!(run["stages"].as_array().unwrap().len(), 1);

        let log = execute(
            Command::StageLog {
                id: done.to_string(),
                stage_index: 0,
            },
            &config,
        )
        .await
        .unwrap();
        assert_eq!(log["stage_index"], 0);
    }

    #[tokio::test]
    async fn test_recover_and_last_success() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (_, open) = seed(&config).await;

        let report = execute(Command::Recover, &config).await.unwrap();
        assert_eq!(report["runs"][0], open.to_string());
        assert!(report["changes"].as_array().unwrap().is_empty());

        let last = execute(
            Command::LastSuccess {
                change_type: ChangeType::Update,
            },
            &config,
        )
        .await
        .unwrap();
        assert_eq!(last["result"]["manifest"][0], "core@3.0");

        assert!(execute(
            Command::LastSuccess {
                change_type: ChangeType::Restore
            },
            &config
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_changes_listing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        seed(&config).await;

        let page = execute(
            Command::Changes {
                change_type: Some(ChangeType::Update),
                outcome: None,
                text: Some("3.0".into()),
                page: 1,
                page_size: 20,
                ascending: false,
            },
            &config,
        )
        .await
        .unwrap();
        assert_eq!(page["total"], 1);
    }
}
