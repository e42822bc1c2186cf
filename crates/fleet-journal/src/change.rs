//! Change journal - audit-level, two-phase state change records
//!
//! Every state-changing event gets an `Initiated` record when it starts and
//! a `Completed` record once its outcome is known. Backups additionally get a
//! dedicated artifact directory allocated at initiation.

use crate::error::{JournalError, Result};
use crate::layout::{self, JournalLayout};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use fleet_types::{
    ChangeId, ChangeOutcome, ChangePhase, ChangeQuery, ChangeRecord, ChangeSummary, ChangeType,
    MasterActionId, Page, StateChangeFinalization, StateChangeHandle, StateChangeRequest,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Audit-level journal of state changes
#[async_trait]
pub trait ChangeJournal: Send + Sync {
    /// Write the `Initiated` record, allocating an artifact directory for backups
    async fn initiate_state_change(&self, request: StateChangeRequest) -> Result<StateChangeHandle>;

    /// Write the `Completed` record with its outcome and serialized result
    async fn finalize_state_change(&self, finalization: StateChangeFinalization) -> Result<ChangeSummary>;

    async fn get_change(&self, change_id: &ChangeId) -> Result<Option<ChangeSummary>>;

    /// Filtered, sorted, paginated listing
    async fn list_changes(&self, query: &ChangeQuery) -> Result<Page<ChangeSummary>>;

    /// Most recently completed successful change of a type
    async fn latest_successful(&self, change_type: ChangeType) -> Result<Option<ChangeSummary>>;

    /// Result document stored by finalization
    async fn read_result(&self, change_id: &ChangeId) -> Result<Option<serde_json::Value>>;

    /// Close out changes left pending by a previous process
    async fn recover_interrupted(&self) -> Result<Vec<ChangeId>>;

    /// Drop cached change-to-workflow associations of a finished run
    fn forget_master_action(&self, master_action_id: &MasterActionId);
}

/// File-backed change journal with an append-only JSON-lines index
pub struct FileChangeJournal {
    layout: JournalLayout,
    sync_writes: bool,
    /// Serializes index appends and the read-check-write of finalization
    write_lock: Mutex<()>,
    summaries: RwLock<HashMap<ChangeId, ChangeSummary>>,
    /// In-flight change -> originating workflow
    sources: DashMap<ChangeId, MasterActionId>,
}

impl FileChangeJournal {
    /// Open the journal, replaying the index into memory
    pub async fn open(layout: JournalLayout, sync_writes: bool) -> Result<Self> {
        tokio::fs::create_dir_all(layout.changes_dir()).await?;

        let records: Vec<ChangeRecord> = layout::read_json_lines(&layout.change_index()).await?;
        let mut summaries: HashMap<ChangeId, ChangeSummary> = HashMap::new();
        let sources = DashMap::new();

        for record in &records {
            match record.phase {
                ChangePhase::Initiated => {
                    summaries.insert(record.change_id, ChangeSummary::from_initiated(record));
                }
                ChangePhase::Completed => match summaries.get_mut(&record.change_id) {
                    Some(summary) => summary.complete(record),
                    None => warn!(change_id = %record.change_id, "Completed record without initiation"),
                },
            }
        }

        for summary in summaries.values().filter(|s| s.is_pending()) {
            if let Some(ref source) = summary.source_master_action_id {
                sources.insert(summary.change_id, source.clone());
            }
        }

        info!(
            records = records.len(),
            changes = summaries.len(),
            root = %layout.root().display(),
            "Change journal opened"
        );

        Ok(Self {
            layout,
            sync_writes,
            write_lock: Mutex::new(()),
            summaries: RwLock::new(summaries),
            sources,
        })
    }

    pub fn layout(&self) -> &JournalLayout {
        &self.layout
    }

    /// Number of cached change-to-workflow associations
    pub fn cached_sources(&self) -> usize {
        self.sources.len()
    }

    async fn append(&self, record: &ChangeRecord) -> Result<()> {
        layout::append_json_line(&self.layout.change_index(), record, self.sync_writes).await
    }
}

#[async_trait]
impl ChangeJournal for FileChangeJournal {
    #[instrument(skip(self, request), fields(change_type = %request.change_type))]
    async fn initiate_state_change(&self, request: StateChangeRequest) -> Result<StateChangeHandle> {
        let change_id = ChangeId::generate();

        let backup_artifact_path = if request.change_type == ChangeType::Backup {
            let dir = self.layout.change_artifact_dir(&change_id);
            tokio::fs::create_dir_all(&dir).await?;
            Some(dir)
        } else {
            None
        };

        let record = ChangeRecord {
            change_id,
            phase: ChangePhase::Initiated,
            change_type: request.change_type,
            timestamp: Utc::now(),
            outcome: None,
            description: request.description,
            artifact_path: backup_artifact_path.clone(),
            source_master_action_id: request.source_master_action_id.clone(),
            initiated_by: request.initiated_by,
            result_path: None,
        };

        {
            let _guard = self.write_lock.lock().await;
            self.append(&record).await?;
            self.summaries
                .write()
                .insert(change_id, ChangeSummary::from_initiated(&record));
        }

        if let Some(source) = request.source_master_action_id {
            self.sources.insert(change_id, source);
        }

        info!(change_id = %change_id, "State change initiated");

        Ok(StateChangeHandle {
            change_id,
            backup_artifact_path,
        })
    }

    #[instrument(skip(self, finalization), fields(change_id = %finalization.change_id))]
    async fn finalize_state_change(&self, finalization: StateChangeFinalization) -> Result<ChangeSummary> {
        let change_id = finalization.change_id;
        let _guard = self.write_lock.lock().await;

        let current = self
            .summaries
            .read()
            .get(&change_id)
            .cloned()
            .ok_or(JournalError::UnknownChange(change_id))?;
        if !current.is_pending() {
            return Err(JournalError::AlreadyFinalized(change_id));
        }

        let result_path = self.layout.change_result(&change_id);
        layout::write_json(&result_path, &finalization.result, self.sync_writes).await?;

        // The originating workflow comes from the in-process cache, not the caller
        let source = self
            .sources
            .get(&change_id)
            .map(|s| s.clone())
            .or_else(|| current.source_master_action_id.clone());

        let record = ChangeRecord {
            change_id,
            phase: ChangePhase::Completed,
            change_type: current.change_type,
            timestamp: Utc::now(),
            outcome: Some(finalization.outcome),
            description: finalization
                .description
                .unwrap_or_else(|| current.description.clone()),
            artifact_path: current.artifact_path.clone(),
            source_master_action_id: source,
            initiated_by: current.initiated_by.clone(),
            result_path: Some(result_path),
        };
        self.append(&record).await?;

        let summary = {
            let mut summaries = self.summaries.write();
            let summary = summaries
                .get_mut(&change_id)
                .ok_or(JournalError::UnknownChange(change_id))?;
            summary.complete(&record);
            summary.clone()
        };
        self.sources.remove(&change_id);

        info!(change_id = %change_id, outcome = ?finalization.outcome, "State change finalized");

        Ok(summary)
    }

    async fn get_change(&self, change_id: &ChangeId) -> Result<Option<ChangeSummary>> {
        Ok(self.summaries.read().get(change_id).cloned())
    }

    async fn list_changes(&self, query: &ChangeQuery) -> Result<Page<ChangeSummary>> {
        let rows: Vec<ChangeSummary> = self.summaries.read().values().cloned().collect();
        Ok(query.apply(rows))
    }

    async fn latest_successful(&self, change_type: ChangeType) -> Result<Option<ChangeSummary>> {
        Ok(self
            .summaries
            .read()
            .values()
            .filter(|s| s.change_type == change_type && s.outcome == Some(ChangeOutcome::Success))
            .max_by_key(|s| (s.completed_at, s.initiated_at))
            .cloned())
    }

    async fn read_result(&self, change_id: &ChangeId) -> Result<Option<serde_json::Value>> {
        let path = self
            .summaries
            .read()
            .get(change_id)
            .and_then(|s| s.result_path.clone());
        match path {
            Some(path) => layout::read_json(&path).await,
            None => Ok(None),
        }
    }

    async fn recover_interrupted(&self) -> Result<Vec<ChangeId>> {
        let pending: Vec<ChangeId> = self
            .summaries
            .read()
            .values()
            .filter(|s| s.is_pending())
            .map(|s| s.change_id)
            .collect();

        let mut recovered = Vec::with_capacity(pending.len());
        for change_id in pending {
            let finalization = StateChangeFinalization::new(
                change_id,
                ChangeOutcome::Interrupted,
                serde_json::json!({ "reason": "master restarted before the change was finalized" }),
            );
            match self.finalize_state_change(finalization).await {
                Ok(_) => recovered.push(change_id),
                // Finalized concurrently
                Err(JournalError::AlreadyFinalized(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if !recovered.is_empty() {
            warn!(count = recovered.len(), "Recovered interrupted state changes");
        }
        Ok(recovered)
    }

    fn forget_master_action(&self, master_action_id: &MasterActionId) {
        self.sources.retain(|_, source| source != master_action_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn journal(dir: &tempfile::TempDir) -> FileChangeJournal {
        FileChangeJournal::open(JournalLayout::new(dir.path()), false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_backup_allocates_artifact_dir() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir).await;

        let handle = j
            .initiate_state_change(StateChangeRequest::new(ChangeType::Backup, "nightly"))
            .await
            .unwrap();
        let path = handle.backup_artifact_path.unwrap();
        assert!(path.is_dir());

        let update = j
            .initiate_state_change(StateChangeRequest::new(ChangeType::Update, "v2"))
            .await
            .unwrap();
        assert!(update.backup_artifact_path.is_none());
    }

    #[tokio::test]
    async fn test_finalize_correlates_cached_source() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir).await;
        let ma = MasterActionId::new("ma-abc");

        let handle = j
            .initiate_state_change(
                StateChangeRequest::new(ChangeType::Update, "update to 2.1").for_master_action(ma.clone()),
            )
            .await
            .unwrap();
        assert_eq!(j.cached_sources(), 1);

        let summary = j
            .finalize_state_change(StateChangeFinalization::new(
                handle.change_id,
                ChangeOutcome::Success,
                serde_json::json!({ "manifest": ["pkg-a@2.1"] }),
            ))
            .await
            .unwrap();

        assert_eq!(summary.source_master_action_id, Some(ma));
        assert_eq!(summary.outcome, Some(ChangeOutcome::Success));
        assert_eq!(j.cached_sources(), 0);

        let result = j.read_result(&handle.change_id).await.unwrap().unwrap();
        assert_eq!(result["manifest"][0], "pkg-a@2.1");
    }

    #[tokio::test]
    async fn test_finalize_unknown_and_twice() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir).await;

        let err = j
            .finalize_state_change(StateChangeFinalization::new(
                ChangeId::generate(),
                ChangeOutcome::Success,
                serde_json::Value::Null,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::UnknownChange(_)));

        let handle = j
            .initiate_state_change(StateChangeRequest::new(ChangeType::Restore, "restore"))
            .await
            .unwrap();
        let fin = StateChangeFinalization::new(handle.change_id, ChangeOutcome::Failure, serde_json::Value::Null);
        j.finalize_state_change(fin.clone()).await.unwrap();
        let err = j.finalize_state_change(fin).await.unwrap_err();
        assert!(matches!(err, JournalError::AlreadyFinalized(_)));
    }

    #[tokio::test]
    async fn test_latest_successful_skips_failures() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir).await;

        let ok = j
            .initiate_state_change(StateChangeRequest::new(ChangeType::Update, "good"))
            .await
            .unwrap();
        j.finalize_state_change(StateChangeFinalization::new(ok.change_id, ChangeOutcome::Success, serde_json::Value::Null))
            .await
            .unwrap();

        let bad = j
            .initiate_state_change(StateChangeRequest::new(ChangeType::Update, "bad"))
            .await
            .unwrap();
        j.finalize_state_change(StateChangeFinalization::new(bad.change_id, ChangeOutcome::Failure, serde_json::Value::Null))
            .await
            .unwrap();

        let latest = j.latest_successful(ChangeType::Update).await.unwrap().unwrap();
        assert_eq!(latest.change_id, ok.change_id);
        assert!(j.latest_successful(ChangeType::Backup).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reopen_replays_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let pending = {
            let j = journal(&dir).await;
            let done = j
                .initiate_state_change(StateChangeRequest::new(ChangeType::Backup, "done"))
                .await
                .unwrap();
            j.finalize_state_change(StateChangeFinalization::new(done.change_id, ChangeOutcome::Success, serde_json::Value::Null))
                .await
                .unwrap();
            j.initiate_state_change(StateChangeRequest::new(ChangeType::Backup, "crashed"))
                .await
                .unwrap()
        };

        let j = journal(&dir).await;
        let page = j.list_changes(&ChangeQuery::default()).await.unwrap();
        assert_eq!(page.total, 2);

        let recovered = j.recover_interrupted().await.unwrap();
        assert_eq!(recovered, vec![pending.change_id]);
        let summary = j.get_change(&pending.change_id).await.unwrap().unwrap();
        assert_eq!(summary.outcome, Some(ChangeOutcome::Interrupted));
    }

    #[tokio::test]
    async fn test_forget_master_action_purges_cache() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir).await;
        let ma = MasterActionId::new("ma-1");
        j.initiate_state_change(StateChangeRequest::new(ChangeType::Backup, "b").for_master_action(ma.clone()))
            .await
            .unwrap();
        j.initiate_state_change(
            StateChangeRequest::new(ChangeType::Backup, "other").for_master_action(MasterActionId::new("ma-2")),
        )
        .await
        .unwrap();

        j.forget_master_action(&ma);
        assert_eq!(j.cached_sources(), 1);
    }
}
