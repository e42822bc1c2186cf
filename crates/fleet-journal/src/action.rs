//! Action journal - hierarchical per-run debug trail
//!
//! Each master action gets a directory holding its latest durable snapshot,
//! one subdirectory per stage (input, result, logs) and run-level logs for
//! lines produced while no stage was open.

use crate::error::{JournalError, Result};
use crate::layout::{self, JournalLayout, MASTER_LOG};
use crate::translator::ActionIdTranslator;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use fleet_types::{MasterAction, MasterActionId, MasterActionStatus, NodeActionId, OperationType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const INPUT_FILE: &str = "input.json";
const RESULT_FILE: &str = "result.json";
const LOGS_DIR: &str = "logs";

/// Message stored on runs closed out by recovery
pub const INTERRUPTED_MESSAGE: &str = "interrupted: master restarted before completion";

/// Severity of a master log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One master-side log line, tagged with the stage active when it was produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub stage_index: Option<usize>,
}

impl LogLine {
    pub fn new(level: LogLevel, message: impl Into<String>, stage_index: Option<usize>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            stage_index,
        }
    }

    /// Rendered form, as written to log files
    pub fn render(&self) -> String {
        format!("{} [{}] {}", format_timestamp(&self.timestamp), self.level, self.message)
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Line of the actions index
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
enum ActionIndexEntry {
    Initiated {
        master_action_id: MasterActionId,
        operation_type: OperationType,
        initiated_by: String,
        timestamp: DateTime<Utc>,
    },
    Completed {
        master_action_id: MasterActionId,
        status: MasterActionStatus,
        timestamp: DateTime<Utc>,
    },
}

/// Index row for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub master_action_id: MasterActionId,
    pub operation_type: OperationType,
    pub initiated_by: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal status once completed
    pub status: Option<MasterActionStatus>,
}

impl RunSummary {
    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// Stored input of a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInputEnvelope {
    pub stage_index: usize,
    pub stage_name: String,
    pub started_at: DateTime<Utc>,
    pub input: serde_json::Value,
}

/// Stored result of a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResultEnvelope {
    pub stage_index: usize,
    pub is_success: bool,
    pub completed_at: DateTime<Utc>,
    pub result: serde_json::Value,
}

/// One stage of a reconstructed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDetails {
    pub index: usize,
    pub name: Option<String>,
    pub input: Option<StageInputEnvelope>,
    pub result: Option<StageResultEnvelope>,
    /// Log files of the stage (`master.log`, `node-<name>.log`)
    pub log_sources: Vec<String>,
}

/// Full reconstruction of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRunDetails {
    pub master_action: MasterAction,
    pub stages: Vec<StageDetails>,
    pub run_log: Option<String>,
}

/// Stage a node action was dispatched in
#[derive(Debug, Clone)]
struct StageLocation {
    master_action_id: MasterActionId,
    stage_index: usize,
    stage_dir: PathBuf,
}

/// Debug-level journal of master action runs
#[async_trait]
pub trait ActionJournal: Send + Sync {
    /// Create the run entry and its first durable snapshot
    async fn record_initiated(&self, action: &MasterAction) -> Result<()>;

    /// Overwrite the durable snapshot of a run still in progress
    async fn record_checkpoint(&self, action: &MasterAction) -> Result<()>;

    async fn record_stage_started(
        &self,
        id: &MasterActionId,
        stage_index: usize,
        stage_name: &str,
        input: serde_json::Value,
    ) -> Result<()>;

    async fn record_stage_result(
        &self,
        id: &MasterActionId,
        stage_index: usize,
        is_success: bool,
        result: serde_json::Value,
    ) -> Result<()>;

    /// Remember the stage a node action belongs to, for routing its logs
    async fn register_node_action(
        &self,
        master_action_id: &MasterActionId,
        node_action_id: &NodeActionId,
        stage_index: usize,
    ) -> Result<()>;

    async fn append_master_log(&self, id: &MasterActionId, lines: &[LogLine]) -> Result<()>;

    /// File a node-originated line under its stage; `false` when it cannot be routed
    async fn append_node_log(
        &self,
        node_action_id: &NodeActionId,
        node_name: &str,
        line: &str,
    ) -> Result<bool>;

    /// Write the final snapshot and the terminal index record
    async fn record_completed(&self, action: &MasterAction) -> Result<()>;

    async fn get_run(&self, id: &MasterActionId) -> Result<Option<ActionRunDetails>>;

    async fn get_archived_master_action(&self, id: &MasterActionId) -> Result<Option<MasterAction>>;

    async fn get_stage_result_value(
        &self,
        id: &MasterActionId,
        stage_index: usize,
    ) -> Result<Option<StageResultEnvelope>>;

    /// Concatenated text of every log file of a stage
    async fn get_stage_logs(&self, id: &MasterActionId, stage_index: usize) -> Result<Option<String>>;

    /// Last `n` master log lines of a run, across run and stage logs
    async fn tail_master_log(&self, id: &MasterActionId, n: usize) -> Result<Vec<String>>;

    /// Most recent runs first
    async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>>;

    async fn recover_interrupted(&self) -> Result<Vec<MasterActionId>>;

    /// Drop the routing state kept for a finished run
    fn forget_master_action(&self, id: &MasterActionId);
}

/// File-backed action journal
pub struct FileActionJournal {
    layout: JournalLayout,
    sync_writes: bool,
    translator: Arc<ActionIdTranslator>,
    index_lock: Mutex<()>,
    /// Serializes log appends so concurrent lines never interleave mid-line
    log_lock: Mutex<()>,
    runs: RwLock<HashMap<MasterActionId, RunSummary>>,
    stage_dirs: DashMap<MasterActionId, BTreeMap<usize, PathBuf>>,
    node_stages: DashMap<NodeActionId, StageLocation>,
}

impl FileActionJournal {
    /// Open the journal, replaying the actions index
    pub async fn open(
        layout: JournalLayout,
        sync_writes: bool,
        translator: Arc<ActionIdTranslator>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(layout.actions_dir()).await?;

        let entries: Vec<ActionIndexEntry> = layout::read_json_lines(&layout.action_index()).await?;
        let mut runs: HashMap<MasterActionId, RunSummary> = HashMap::new();

        for entry in &entries {
            match entry {
                ActionIndexEntry::Initiated {
                    master_action_id,
                    operation_type,
                    initiated_by,
                    timestamp,
                } => {
                    runs.insert(
                        master_action_id.clone(),
                        RunSummary {
                            master_action_id: master_action_id.clone(),
                            operation_type: operation_type.clone(),
                            initiated_by: initiated_by.clone(),
                            started_at: *timestamp,
                            completed_at: None,
                            status: None,
                        },
                    );
                }
                ActionIndexEntry::Completed {
                    master_action_id,
                    status,
                    timestamp,
                } => match runs.get_mut(master_action_id) {
                    Some(run) => {
                        run.completed_at = Some(*timestamp);
                        run.status = Some(*status);
                    }
                    None => warn!(%master_action_id, "Completed run without initiation"),
                },
            }
        }

        info!(
            records = entries.len(),
            runs = runs.len(),
            root = %layout.root().display(),
            "Action journal opened"
        );

        Ok(Self {
            layout,
            sync_writes,
            translator,
            index_lock: Mutex::new(()),
            log_lock: Mutex::new(()),
            runs: RwLock::new(runs),
            stage_dirs: DashMap::new(),
            node_stages: DashMap::new(),
        })
    }

    pub fn translator(&self) -> &Arc<ActionIdTranslator> {
        &self.translator
    }

    /// Only indexed runs are resolved to paths
    fn is_known(&self, id: &MasterActionId) -> bool {
        self.runs.read().contains_key(id)
    }

    fn ensure_known(&self, id: &MasterActionId) -> Result<()> {
        if self.is_known(id) {
            Ok(())
        } else {
            Err(JournalError::UnknownRun(id.clone()))
        }
    }

    async fn stage_dir(&self, id: &MasterActionId, stage_index: usize) -> Result<Option<PathBuf>> {
        if let Some(dir) = self
            .stage_dirs
            .get(id)
            .and_then(|stages| stages.get(&stage_index).cloned())
        {
            return Ok(Some(dir));
        }
        layout::find_stage_dir(&self.layout.stages_dir(id), stage_index).await
    }

    async fn append_index(&self, entry: &ActionIndexEntry) -> Result<()> {
        layout::append_json_line(&self.layout.action_index(), entry, self.sync_writes).await
    }
}

#[async_trait]
impl ActionJournal for FileActionJournal {
    #[instrument(skip(self, action), fields(master_action_id = %action.id))]
    async fn record_initiated(&self, action: &MasterAction) -> Result<()> {
        if !action.id.is_path_safe() {
            return Err(JournalError::InvalidRunId(action.id.clone()));
        }
        layout::write_json(&self.layout.run_snapshot(&action.id), action, self.sync_writes).await?;

        let entry = ActionIndexEntry::Initiated {
            master_action_id: action.id.clone(),
            operation_type: action.operation_type.clone(),
            initiated_by: action.initiated_by.clone(),
            timestamp: action.start_time,
        };

        let _guard = self.index_lock.lock().await;
        self.append_index(&entry).await?;
        self.runs.write().insert(
            action.id.clone(),
            RunSummary {
                master_action_id: action.id.clone(),
                operation_type: action.operation_type.clone(),
                initiated_by: action.initiated_by.clone(),
                started_at: action.start_time,
                completed_at: None,
                status: None,
            },
        );

        debug!("Run recorded");
        Ok(())
    }

    async fn record_checkpoint(&self, action: &MasterAction) -> Result<()> {
        self.ensure_known(&action.id)?;
        layout::write_json(&self.layout.run_snapshot(&action.id), action, self.sync_writes).await
    }

    #[instrument(skip(self, input), fields(master_action_id = %id))]
    async fn record_stage_started(
        &self,
        id: &MasterActionId,
        stage_index: usize,
        stage_name: &str,
        input: serde_json::Value,
    ) -> Result<()> {
        self.ensure_known(id)?;

        let dir = self.layout.stage_dir(id, stage_index, stage_name);
        tokio::fs::create_dir_all(dir.join(LOGS_DIR)).await?;

        let envelope = StageInputEnvelope {
            stage_index,
            stage_name: stage_name.to_string(),
            started_at: Utc::now(),
            input,
        };
        layout::write_json(&dir.join(INPUT_FILE), &envelope, self.sync_writes).await?;

        self.stage_dirs
            .entry(id.clone())
            .or_default()
            .insert(stage_index, dir);

        debug!(stage = stage_name, stage_index, "Stage recorded");
        Ok(())
    }

    #[instrument(skip(self, result), fields(master_action_id = %id))]
    async fn record_stage_result(
        &self,
        id: &MasterActionId,
        stage_index: usize,
        is_success: bool,
        result: serde_json::Value,
    ) -> Result<()> {
        self.ensure_known(id)?;
        let dir = self
            .stage_dir(id, stage_index)
            .await?
            .ok_or_else(|| JournalError::UnknownStage {
                id: id.clone(),
                stage_index,
            })?;

        let envelope = StageResultEnvelope {
            stage_index,
            is_success,
            completed_at: Utc::now(),
            result,
        };
        layout::write_json(&dir.join(RESULT_FILE), &envelope, self.sync_writes).await
    }

    async fn register_node_action(
        &self,
        master_action_id: &MasterActionId,
        node_action_id: &NodeActionId,
        stage_index: usize,
    ) -> Result<()> {
        self.ensure_known(master_action_id)?;
        let stage_dir = self
            .stage_dir(master_action_id, stage_index)
            .await?
            .ok_or_else(|| JournalError::UnknownStage {
                id: master_action_id.clone(),
                stage_index,
            })?;

        self.translator
            .register_mapping(node_action_id.clone(), master_action_id.clone());
        self.node_stages.insert(
            node_action_id.clone(),
            StageLocation {
                master_action_id: master_action_id.clone(),
                stage_index,
                stage_dir,
            },
        );
        Ok(())
    }

    async fn append_master_log(&self, id: &MasterActionId, lines: &[LogLine]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        self.ensure_known(id)?;

        // Group by target file, keeping production order within each
        let mut batches: BTreeMap<PathBuf, String> = BTreeMap::new();
        for line in lines {
            let logs_dir = match line.stage_index {
                Some(index) => match self.stage_dir(id, index).await? {
                    Some(dir) => dir.join(LOGS_DIR),
                    None => self.layout.run_logs_dir(id),
                },
                None => self.layout.run_logs_dir(id),
            };
            let text = batches.entry(logs_dir.join(MASTER_LOG)).or_default();
            text.push_str(&line.render());
            text.push('\n');
        }

        let _guard = self.log_lock.lock().await;
        for (path, text) in batches {
            layout::append_text(&path, &text, self.sync_writes).await?;
        }
        Ok(())
    }

    async fn append_node_log(
        &self,
        node_action_id: &NodeActionId,
        node_name: &str,
        line: &str,
    ) -> Result<bool> {
        let Some(master_action_id) = self
            .translator
            .translate_node_action_id_to_master_action_id(node_action_id)
        else {
            warn!(%node_action_id, node = node_name, "Dropping log line for unknown node action");
            return Ok(false);
        };

        let logs_dir = match self.node_stages.get(node_action_id) {
            Some(location) => {
                debug!(%node_action_id, stage_index = location.stage_index, "Routing node log line");
                location.stage_dir.join(LOGS_DIR)
            }
            None => self.layout.run_logs_dir(&master_action_id),
        };
        let path = logs_dir.join(format!("node-{}.log", layout::slug(node_name)));
        let text = format!("{} {}\n", format_timestamp(&Utc::now()), line.trim_end());

        let _guard = self.log_lock.lock().await;
        layout::append_text(&path, &text, self.sync_writes).await?;
        Ok(true)
    }

    #[instrument(skip(self, action), fields(master_action_id = %action.id, status = %action.overall_status))]
    async fn record_completed(&self, action: &MasterAction) -> Result<()> {
        self.ensure_known(&action.id)?;
        layout::write_json(&self.layout.run_snapshot(&action.id), action, self.sync_writes).await?;

        let timestamp = action.end_time.unwrap_or_else(Utc::now);
        let entry = ActionIndexEntry::Completed {
            master_action_id: action.id.clone(),
            status: action.overall_status,
            timestamp,
        };

        let _guard = self.index_lock.lock().await;
        self.append_index(&entry).await?;
        if let Some(run) = self.runs.write().get_mut(&action.id) {
            run.completed_at = Some(timestamp);
            run.status = Some(action.overall_status);
        }

        info!("Run completed");
        Ok(())
    }

    async fn get_run(&self, id: &MasterActionId) -> Result<Option<ActionRunDetails>> {
        let Some(master_action) = self.get_archived_master_action(id).await? else {
            return Ok(None);
        };

        let mut stages = Vec::new();
        for (index, dir) in layout::list_stage_dirs(&self.layout.stages_dir(id)).await? {
            let input: Option<StageInputEnvelope> = layout::read_json(&dir.join(INPUT_FILE)).await?;
            let result: Option<StageResultEnvelope> = layout::read_json(&dir.join(RESULT_FILE)).await?;
            stages.push(StageDetails {
                index,
                name: input.as_ref().map(|i| i.stage_name.clone()),
                input,
                result,
                log_sources: list_log_files(&dir.join(LOGS_DIR)).await?,
            });
        }

        let run_log = layout::read_text(&self.layout.run_logs_dir(id).join(MASTER_LOG)).await?;

        Ok(Some(ActionRunDetails {
            master_action,
            stages,
            run_log,
        }))
    }

    async fn get_archived_master_action(&self, id: &MasterActionId) -> Result<Option<MasterAction>> {
        if !self.is_known(id) {
            return Ok(None);
        }
        layout::read_json(&self.layout.run_snapshot(id)).await
    }

    async fn get_stage_result_value(
        &self,
        id: &MasterActionId,
        stage_index: usize,
    ) -> Result<Option<StageResultEnvelope>> {
        if !self.is_known(id) {
            return Ok(None);
        }
        match self.stage_dir(id, stage_index).await? {
            Some(dir) => layout::read_json(&dir.join(RESULT_FILE)).await,
            None => Ok(None),
        }
    }

    async fn get_stage_logs(&self, id: &MasterActionId, stage_index: usize) -> Result<Option<String>> {
        if !self.is_known(id) {
            return Ok(None);
        }
        let Some(dir) = self.stage_dir(id, stage_index).await? else {
            return Ok(None);
        };
        let logs_dir = dir.join(LOGS_DIR);

        let mut out = String::new();
        for name in list_log_files(&logs_dir).await? {
            if let Some(text) = layout::read_text(&logs_dir.join(&name)).await? {
                out.push_str(&format!("==> {} <==\n", name));
                out.push_str(&text);
            }
        }
        Ok(Some(out))
    }

    async fn tail_master_log(&self, id: &MasterActionId, n: usize) -> Result<Vec<String>> {
        if !self.is_known(id) {
            return Ok(Vec::new());
        }

        let mut files = vec![self.layout.run_logs_dir(id).join(MASTER_LOG)];
        for (_, dir) in layout::list_stage_dirs(&self.layout.stages_dir(id)).await? {
            files.push(dir.join(LOGS_DIR).join(MASTER_LOG));
        }

        let mut entries: Vec<LogEntry> = Vec::new();
        for path in files {
            if let Some(text) = layout::read_text(&path).await? {
                collect_entries(&text, &mut entries);
            }
        }
        // Stable: equal timestamps keep file and write order
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let mut lines: Vec<String> = entries.into_iter().flat_map(|e| e.lines).collect();
        let skip = lines.len().saturating_sub(n);
        Ok(lines.split_off(skip))
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let mut runs: Vec<RunSummary> = self.runs.read().values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn recover_interrupted(&self) -> Result<Vec<MasterActionId>> {
        let open: Vec<MasterActionId> = self
            .runs
            .read()
            .values()
            .filter(|r| r.is_open())
            .map(|r| r.master_action_id.clone())
            .collect();

        let mut recovered = Vec::with_capacity(open.len());
        for id in open {
            match self.get_archived_master_action(&id).await? {
                Some(mut action) => {
                    if !action.finish(MasterActionStatus::Failed, Some(INTERRUPTED_MESSAGE.to_string())) {
                        // Terminal snapshot was written but the index record was lost
                        debug!(master_action_id = %id, "Snapshot already terminal");
                    }
                    self.record_completed(&action).await?;
                }
                None => {
                    let timestamp = Utc::now();
                    let _guard = self.index_lock.lock().await;
                    self.append_index(&ActionIndexEntry::Completed {
                        master_action_id: id.clone(),
                        status: MasterActionStatus::Failed,
                        timestamp,
                    })
                    .await?;
                    if let Some(run) = self.runs.write().get_mut(&id) {
                        run.completed_at = Some(timestamp);
                        run.status = Some(MasterActionStatus::Failed);
                    }
                }
            }
            recovered.push(id);
        }

        if !recovered.is_empty() {
            warn!(count = recovered.len(), "Recovered interrupted runs");
        }
        Ok(recovered)
    }

    fn forget_master_action(&self, id: &MasterActionId) {
        self.stage_dirs.remove(id);
        self.node_stages
            .retain(|_, location| &location.master_action_id != id);
    }
}

/// A rendered log line plus any continuation lines of a multi-line message
struct LogEntry {
    timestamp: Option<DateTime<Utc>>,
    lines: Vec<String>,
}

fn collect_entries(text: &str, entries: &mut Vec<LogEntry>) {
    let mut current: Option<LogEntry> = None;
    for line in text.lines() {
        let timestamp = line
            .split_once(' ')
            .and_then(|(prefix, _)| DateTime::parse_from_rfc3339(prefix).ok())
            .map(|ts| ts.with_timezone(&Utc));
        if timestamp.is_none() {
            if let Some(entry) = current.as_mut() {
                entry.lines.push(line.to_string());
                continue;
            }
        }
        entries.extend(current.take());
        current = Some(LogEntry {
            timestamp,
            lines: vec![line.to_string()],
        });
    }
    entries.extend(current);
}

async fn list_log_files(logs_dir: &std::path::Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(logs_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".log") {
            names.push(name);
        }
    }
    // master.log first, then node logs by name
    names.sort_by(|a, b| (a != MASTER_LOG, a).cmp(&(b != MASTER_LOG, b)));
    Ok(names)
}

impl fmt::Debug for FileActionJournal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileActionJournal")
            .field("root", &self.layout.root())
            .field("runs", &self.runs.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::{OperationType, Parameters};

    async fn journal(dir: &tempfile::TempDir) -> FileActionJournal {
        FileActionJournal::open(
            JournalLayout::new(dir.path()),
            false,
            Arc::new(ActionIdTranslator::new()),
        )
        .await
        .unwrap()
    }

    fn action() -> MasterAction {
        let mut a = MasterAction::new(
            MasterActionId::generate(),
            OperationType::ENV_BACKUP,
            None,
            "alice",
            Parameters::new(),
        );
        a.transition_to(MasterActionStatus::Running).unwrap();
        a
    }

    #[tokio::test]
    async fn test_stage_input_result_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir).await;
        let a = action();
        j.record_initiated(&a).await.unwrap();

        j.record_stage_started(&a.id, 0, "Take Snapshot", serde_json::json!({"nodes": ["n1"]}))
            .await
            .unwrap();
        j.append_master_log(
            &a.id,
            &[
                LogLine::new(LogLevel::Info, "before stage", None),
                LogLine::new(LogLevel::Info, "snapshotting", Some(0)),
            ],
        )
        .await
        .unwrap();
        j.record_stage_result(&a.id, 0, true, serde_json::json!({"bytes": 42}))
            .await
            .unwrap();

        let result = j.get_stage_result_value(&a.id, 0).await.unwrap().unwrap();
        assert!(result.is_success);
        assert_eq!(result.result["bytes"], 42);

        let logs = j.get_stage_logs(&a.id, 0).await.unwrap().unwrap();
        assert!(logs.contains("snapshotting"));
        assert!(!logs.contains("before stage"));

        let details = j.get_run(&a.id).await.unwrap().unwrap();
        assert_eq!(details.stages.len(), 1);
        assert_eq!(details.stages[0].name.as_deref(), Some("Take Snapshot"));
        assert!(details.run_log.unwrap().contains("before stage"));
    }

    #[tokio::test]
    async fn test_stage_result_for_unknown_stage() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir).await;
        let a = action();
        j.record_initiated(&a).await.unwrap();

        let err = j
            .record_stage_result(&a.id, 3, true, serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::UnknownStage { stage_index: 3, .. }));

        let err = j
            .record_stage_started(&MasterActionId::new("ma-missing"), 0, "x", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::UnknownRun(_)));
    }

    #[tokio::test]
    async fn test_unroutable_node_log() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir).await;
        let routed = j
            .append_node_log(&NodeActionId::new("na-ghost"), "n1", "hello")
            .await
            .unwrap();
        assert!(!routed);
    }

    #[tokio::test]
    async fn test_tail_master_log_orders_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir).await;
        let a = action();
        j.record_initiated(&a).await.unwrap();
        j.record_stage_started(&a.id, 0, "one", serde_json::Value::Null)
            .await
            .unwrap();

        let mut lines = Vec::new();
        for i in 0..5 {
            let mut line = LogLine::new(LogLevel::Info, format!("line {}", i), if i % 2 == 0 { Some(0) } else { None });
            line.timestamp = Utc::now() + chrono::Duration::milliseconds(i * 10);
            lines.push(line);
        }
        j.append_master_log(&a.id, &lines).await.unwrap();

        let tail = j.tail_master_log(&a.id, 3).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert!(tail[0].ends_with("line 2"));
        assert!(tail[2].ends_with("line 4"));
    }

    #[tokio::test]
    async fn test_tail_keeps_write_order_within_a_millisecond() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir).await;
        let a = action();
        j.record_initiated(&a).await.unwrap();

        let at = Utc::now();
        let mut lines = vec![
            LogLine::new(LogLevel::Warn, "zulu first", None),
            LogLine::new(LogLevel::Info, "alpha second\n  detail one\n  detail two", None),
            LogLine::new(LogLevel::Error, "mike third", None),
        ];
        for line in &mut lines {
            line.timestamp = at;
        }
        j.append_master_log(&a.id, &lines).await.unwrap();

        let tail = j.tail_master_log(&a.id, 10).await.unwrap();
        assert_eq!(tail.len(), 5);
        assert!(tail[0].ends_with("[WARN] zulu first"));
        assert!(tail[1].ends_with("[INFO] alpha second"));
        assert_eq!(tail[2], "  detail one");
        assert_eq!(tail[3], "  detail two");
        assert!(tail[4].ends_with("[ERROR] mike third"));
    }

    #[tokio::test]
    async fn test_unindexed_ids_never_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir).await;
        let mut a = action();
        j.record_initiated(&a).await.unwrap();
        j.record_stage_started(&a.id, 0, "snap", serde_json::Value::Null)
            .await
            .unwrap();
        j.append_master_log(&a.id, &[LogLine::new(LogLevel::Info, "done", Some(0))])
            .await
            .unwrap();
        a.finish(MasterActionStatus::Completed, None);
        j.record_completed(&a).await.unwrap();

        let walked = MasterActionId::new(format!("{}/logs/../../{}", a.id, a.id));
        assert!(j.get_archived_master_action(&walked).await.unwrap().is_none());
        assert!(j.get_run(&walked).await.unwrap().is_none());
        assert!(j.get_stage_logs(&walked, 0).await.unwrap().is_none());
        assert!(j.get_stage_result_value(&walked, 0).await.unwrap().is_none());
        assert!(j.tail_master_log(&walked, 10).await.unwrap().is_empty());

        let outside = MasterActionId::new("../../etc");
        assert!(j.get_archived_master_action(&outside).await.unwrap().is_none());

        let mut bad = action();
        bad.id = walked.clone();
        assert!(matches!(
            j.record_initiated(&bad).await.unwrap_err(),
            JournalError::InvalidRunId(_)
        ));
        assert!(matches!(
            j.append_master_log(&walked, &[LogLine::new(LogLevel::Info, "x", None)])
                .await
                .unwrap_err(),
            JournalError::UnknownRun(_)
        ));
    }

    #[tokio::test]
    async fn test_recover_marks_open_runs_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (open_id, done_id) = {
            let j = journal(&dir).await;
            let open = action();
            j.record_initiated(&open).await.unwrap();
            j.record_stage_started(&open.id, 0, "hang", serde_json::Value::Null)
                .await
                .unwrap();

            let mut done = action();
            j.record_initiated(&done).await.unwrap();
            done.finish(MasterActionStatus::Completed, None);
            j.record_completed(&done).await.unwrap();
            (open.id, done.id)
        };

        let j = journal(&dir).await;
        let recovered = j.recover_interrupted().await.unwrap();
        assert_eq!(recovered, vec![open_id.clone()]);

        let archived = j.get_archived_master_action(&open_id).await.unwrap().unwrap();
        assert_eq!(archived.overall_status, MasterActionStatus::Failed);
        assert_eq!(archived.status_message.as_deref(), Some(INTERRUPTED_MESSAGE));

        let runs = j.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| !r.is_open()));
        assert!(runs
            .iter()
            .any(|r| r.master_action_id == done_id && r.status == Some(MasterActionStatus::Completed)));
    }
}
