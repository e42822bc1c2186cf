//! On-disk layout and low-level file helpers
//!
//! ```text
//! <root>/changes/index.jsonl
//! <root>/changes/artifacts/<change_id>/
//! <root>/changes/results/<change_id>.json
//! <root>/actions/index.jsonl
//! <root>/actions/<ma-id>/master_action.json
//! <root>/actions/<ma-id>/logs/master.log
//! <root>/actions/<ma-id>/stages/<NN>-<slug>/{input.json,result.json,logs/}
//! ```

use crate::error::Result;
use fleet_types::{ChangeId, MasterActionId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

pub(crate) const MASTER_LOG: &str = "master.log";

/// Path scheme under the journal root
#[derive(Debug, Clone)]
pub struct JournalLayout {
    root: PathBuf,
}

impl JournalLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn changes_dir(&self) -> PathBuf {
        self.root.join("changes")
    }

    pub fn change_index(&self) -> PathBuf {
        self.changes_dir().join("index.jsonl")
    }

    pub fn change_artifact_dir(&self, id: &ChangeId) -> PathBuf {
        self.changes_dir().join("artifacts").join(id.to_string())
    }

    pub fn change_result(&self, id: &ChangeId) -> PathBuf {
        self.changes_dir()
            .join("results")
            .join(format!("{}.json", id))
    }

    pub fn actions_dir(&self) -> PathBuf {
        self.root.join("actions")
    }

    pub fn action_index(&self) -> PathBuf {
        self.actions_dir().join("index.jsonl")
    }

    pub fn run_dir(&self, id: &MasterActionId) -> PathBuf {
        self.actions_dir().join(id.as_str())
    }

    pub fn run_snapshot(&self, id: &MasterActionId) -> PathBuf {
        self.run_dir(id).join("master_action.json")
    }

    pub fn run_logs_dir(&self, id: &MasterActionId) -> PathBuf {
        self.run_dir(id).join("logs")
    }

    pub fn stages_dir(&self, id: &MasterActionId) -> PathBuf {
        self.run_dir(id).join("stages")
    }

    pub fn stage_dir(&self, id: &MasterActionId, stage_index: usize, stage_name: &str) -> PathBuf {
        self.stages_dir(id)
            .join(format!("{:02}-{}", stage_index, slug(stage_name)))
    }
}

/// Filesystem-safe form of a stage or node name
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("unnamed");
    }
    out
}

/// Stage index encoded in a stage directory name (`NN-slug`)
pub(crate) fn parse_stage_dir(name: &str) -> Option<usize> {
    name.split_once('-')
        .and_then(|(index, _)| index.parse().ok())
}

/// Locate the directory of stage `stage_index`, if it was ever started
pub(crate) async fn find_stage_dir(stages_dir: &Path, stage_index: usize) -> Result<Option<PathBuf>> {
    Ok(list_stage_dirs(stages_dir)
        .await?
        .into_iter()
        .find(|(index, _)| *index == stage_index)
        .map(|(_, path)| path))
}

/// All stage directories, ordered by index
pub(crate) async fn list_stage_dirs(stages_dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    let mut entries = match fs::read_dir(stages_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut stages = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if let Some(index) = parse_stage_dir(&name.to_string_lossy()) {
            stages.push((index, entry.path()));
        }
    }
    stages.sort_by_key(|(index, _)| *index);
    Ok(stages)
}

/// Append text to a file, creating it and its parents as needed
pub(crate) async fn append_text(path: &Path, text: &str, sync: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    file.write_all(text.as_bytes()).await?;
    file.flush().await?;
    if sync {
        file.sync_data().await?;
    }
    Ok(())
}

/// Append one JSON document as a line
pub(crate) async fn append_json_line<T: Serialize>(path: &Path, value: &T, sync: bool) -> Result<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    append_text(path, &line, sync).await
}

/// Write a JSON document through a temporary file and rename it into place
pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T, sync: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(value)?;

    let mut tmp = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .await?;
    tmp.write_all(&json).await?;
    tmp.flush().await?;
    if sync {
        tmp.sync_data().await?;
    }
    drop(tmp);

    fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Read a JSON document, `None` when the file does not exist
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read a text file, `None` when it does not exist
pub(crate) async fn read_text(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read every record of a JSON-lines file.
///
/// Blank lines are ignored. A line that fails to parse (a torn final write
/// after a crash) is skipped with a warning.
pub(crate) async fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                path = %path.display(),
                line = line_no,
                error = %e,
                "Skipping unreadable journal line"
            ),
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug() {
        assert_eq!(slug("Download Packages"), "download-packages");
        assert_eq!(slug("  weird//name!! "), "weird-name");
        assert_eq!(slug("***"), "unnamed");
    }

    #[test]
    fn test_stage_dir_round_trip() {
        let layout = JournalLayout::new("/tmp/j");
        let id = MasterActionId::new("ma-1");
        let dir = layout.stage_dir(&id, 3, "Apply Config");
        let name = dir.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name, "03-apply-config");
        assert_eq!(parse_stage_dir(&name), Some(3));
    }

    #[tokio::test]
    async fn test_torn_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.jsonl");
        append_json_line(&path, &serde_json::json!({"n": 1}), false).await.unwrap();
        append_text(&path, "{\"n\": 2", false).await.unwrap();

        let records: Vec<serde_json::Value> = read_json_lines(&path).await.unwrap();
        assert_eq!(records.len(), 1);
    }
}
