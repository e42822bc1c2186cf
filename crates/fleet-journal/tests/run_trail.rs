use fleet_journal::{Journal, JournalConfig, LogLevel, LogLine};
use fleet_types::{
    ChangeOutcome, ChangeQuery, ChangeType, MasterAction, MasterActionId, MasterActionStatus,
    NodeActionId, OperationType, Parameters, StateChangeFinalization, StateChangeRequest,
};
use serde::Deserialize;

fn config(dir: &tempfile::TempDir) -> JournalConfig {
    JournalConfig {
        root: dir.path().to_path_buf(),
        sync_writes: false,
        recover_on_open: true,
    }
}

fn running(op: OperationType) -> MasterAction {
    let mut action = MasterAction::new(MasterActionId::generate(), op, None, "ops", Parameters::new());
    action
        .transition_to(MasterActionStatus::Running)
        .expect("initiated -> running");
    action
}

#[derive(Debug, Deserialize, PartialEq)]
struct Manifest {
    packages: Vec<String>,
}

#[tokio::test]
async fn late_node_logs_land_in_their_dispatch_stage() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(&config(&dir)).await.unwrap();
    let action = running(OperationType::ENV_UPDATE_ONLINE);
    journal.actions().record_initiated(&action).await.unwrap();

    journal
        .actions()
        .record_stage_started(&action.id, 0, "download", serde_json::Value::Null)
        .await
        .unwrap();
    let na = NodeActionId::generate();
    journal
        .actions()
        .register_node_action(&action.id, &na, 0)
        .await
        .unwrap();
    journal
        .actions()
        .record_stage_result(&action.id, 0, true, serde_json::json!({"packages": ["a", "b"]}))
        .await
        .unwrap();

    // The run has moved on when the agent output arrives
    journal
        .actions()
        .record_stage_started(&action.id, 1, "install", serde_json::Value::Null)
        .await
        .unwrap();
    assert!(journal.ingest_node_log(&na, "node-7", "download finished").await.unwrap());

    let download = journal.actions().get_stage_logs(&action.id, 0).await.unwrap().unwrap();
    assert!(download.contains("==> node-node-7.log <=="));
    assert!(download.contains("download finished"));
    let install = journal.actions().get_stage_logs(&action.id, 1).await.unwrap().unwrap();
    assert!(!install.contains("download finished"));

    let manifest: Manifest = journal.stage_result(&action.id, 0).await.unwrap().unwrap();
    assert_eq!(manifest.packages, vec!["a", "b"]);

    journal.purge_run(&action.id);
    assert!(journal.translator().is_empty());
    assert!(!journal.ingest_node_log(&na, "node-7", "too late").await.unwrap());
}

#[tokio::test]
async fn master_lines_follow_their_stage_tag() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(&config(&dir)).await.unwrap();
    let action = running(OperationType::DIAGNOSTICS);
    journal.actions().record_initiated(&action).await.unwrap();
    journal
        .actions()
        .record_stage_started(&action.id, 0, "collect", serde_json::Value::Null)
        .await
        .unwrap();

    journal
        .actions()
        .append_master_log(
            &action.id,
            &[
                LogLine::new(LogLevel::Info, "collecting", Some(0)),
                LogLine::new(LogLevel::Warn, "between stages", None),
            ],
        )
        .await
        .unwrap();

    let details = journal.actions().get_run(&action.id).await.unwrap().unwrap();
    assert_eq!(details.stages[0].log_sources, vec!["master.log".to_string()]);
    assert!(details.run_log.unwrap().contains("[WARN] between stages"));
}

#[tokio::test]
async fn reopen_recovers_both_logs() {
    let dir = tempfile::tempdir().unwrap();
    let (run_id, change_id) = {
        let journal = Journal::open(&config(&dir)).await.unwrap();
        let action = running(OperationType::ENV_BACKUP);
        journal.actions().record_initiated(&action).await.unwrap();
        let handle = journal
            .changes()
            .initiate_state_change(
                StateChangeRequest::new(ChangeType::Backup, "backup").for_master_action(action.id.clone()),
            )
            .await
            .unwrap();
        (action.id, handle.change_id)
    };

    let journal = Journal::open(&config(&dir)).await.unwrap();

    let archived = journal
        .actions()
        .get_archived_master_action(&run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(archived.overall_status, MasterActionStatus::Failed);
    assert!(archived.end_time.is_some());

    let change = journal.changes().get_change(&change_id).await.unwrap().unwrap();
    assert_eq!(change.outcome, Some(ChangeOutcome::Interrupted));
    assert_eq!(change.source_master_action_id, Some(run_id));

    // Nothing left to recover
    assert!(journal.recover().await.unwrap().is_empty());
}

#[tokio::test]
async fn change_listing_filters_and_pages() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(&config(&dir)).await.unwrap();

    for i in 0..5 {
        let change_type = if i % 2 == 0 { ChangeType::Update } else { ChangeType::Backup };
        let handle = journal
            .changes()
            .initiate_state_change(StateChangeRequest::new(change_type, format!("change {}", i)))
            .await
            .unwrap();
        journal
            .changes()
            .finalize_state_change(StateChangeFinalization::new(
                handle.change_id,
                ChangeOutcome::Success,
                serde_json::Value::Null,
            ))
            .await
            .unwrap();
    }

    let query = ChangeQuery::builder()
        .change_type(ChangeType::Update)
        .page(1, 2)
        .build();
    let page = journal.changes().list_changes(&query).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 2);
    assert!(page.items.iter().all(|c| c.change_type == ChangeType::Update));
}
