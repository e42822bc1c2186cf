//! Change journal types
//!
//! Discrete state-changing events are recorded in two phases: an
//! `Initiated` record when the change starts and a `Completed` record
//! carrying the outcome once it is known.

use crate::{ChangeId, MasterActionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Kind of state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Update,
    Backup,
    Restore,
    Revert,
    ManualConfigurationChange,
    SystemEvent,
}

impl ChangeType {
    pub const ALL: [ChangeType; 6] = [
        Self::Update,
        Self::Backup,
        Self::Restore,
        Self::Revert,
        Self::ManualConfigurationChange,
        Self::SystemEvent,
    ];
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown change type: {}", s))
    }
}

/// Outcome recorded in the `Completed` phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOutcome {
    Success,
    Failure,
    Cancelled,
    /// The master stopped before the change was finalized
    Interrupted,
}

impl std::str::FromStr for ChangeOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "cancelled" => Ok(Self::Cancelled),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(format!("unknown change outcome: {}", other)),
        }
    }
}

/// Record phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangePhase {
    Initiated,
    Completed,
}

/// One line of the change journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_id: ChangeId,
    pub phase: ChangePhase,
    pub change_type: ChangeType,
    pub timestamp: DateTime<Utc>,
    /// Set on `Completed` records only
    pub outcome: Option<ChangeOutcome>,
    pub description: String,
    pub artifact_path: Option<PathBuf>,
    pub source_master_action_id: Option<MasterActionId>,
    pub initiated_by: Option<String>,
    /// Serialized result artifact, `Completed` records only
    pub result_path: Option<PathBuf>,
}

/// Input for starting a state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeRequest {
    pub change_type: ChangeType,
    pub description: String,
    pub source_master_action_id: Option<MasterActionId>,
    pub initiated_by: Option<String>,
}

impl StateChangeRequest {
    pub fn new(change_type: ChangeType, description: impl Into<String>) -> Self {
        Self {
            change_type,
            description: description.into(),
            source_master_action_id: None,
            initiated_by: None,
        }
    }

    pub fn for_master_action(mut self, id: MasterActionId) -> Self {
        self.source_master_action_id = Some(id);
        self
    }

    pub fn initiated_by(mut self, who: impl Into<String>) -> Self {
        self.initiated_by = Some(who.into());
        self
    }
}

/// Returned when a state change is initiated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeHandle {
    pub change_id: ChangeId,
    /// Dedicated artifact directory, allocated for `Backup` changes
    pub backup_artifact_path: Option<PathBuf>,
}

/// Input for completing a state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeFinalization {
    pub change_id: ChangeId,
    pub outcome: ChangeOutcome,
    /// Replaces the initiation description when set
    pub description: Option<String>,
    pub result: serde_json::Value,
}

impl StateChangeFinalization {
    pub fn new(change_id: ChangeId, outcome: ChangeOutcome, result: serde_json::Value) -> Self {
        Self {
            change_id,
            outcome,
            description: None,
            result,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Both phases of one change folded into a single row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub change_id: ChangeId,
    pub change_type: ChangeType,
    pub description: String,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<ChangeOutcome>,
    pub artifact_path: Option<PathBuf>,
    pub result_path: Option<PathBuf>,
    pub source_master_action_id: Option<MasterActionId>,
    pub initiated_by: Option<String>,
}

impl ChangeSummary {
    /// Start a summary from an `Initiated` record
    pub fn from_initiated(record: &ChangeRecord) -> Self {
        Self {
            change_id: record.change_id,
            change_type: record.change_type,
            description: record.description.clone(),
            initiated_at: record.timestamp,
            completed_at: None,
            outcome: None,
            artifact_path: record.artifact_path.clone(),
            result_path: None,
            source_master_action_id: record.source_master_action_id.clone(),
            initiated_by: record.initiated_by.clone(),
        }
    }

    /// Fold a `Completed` record into the summary
    pub fn complete(&mut self, record: &ChangeRecord) {
        self.completed_at = Some(record.timestamp);
        self.outcome = record.outcome;
        self.description = record.description.clone();
        self.result_path = record.result_path.clone();
        if self.source_master_action_id.is_none() {
            self.source_master_action_id = record.source_master_action_id.clone();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// Field a change listing is sorted by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChangeSortField {
    #[default]
    InitiatedAt,
    CompletedAt,
    ChangeType,
}

/// Filter, sort and pagination for change listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeQuery {
    pub change_type: Option<ChangeType>,
    pub outcome: Option<ChangeOutcome>,
    pub source_master_action_id: Option<MasterActionId>,
    /// Inclusive
    pub from: Option<DateTime<Utc>>,
    /// Exclusive
    pub to: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the description
    pub text: Option<String>,
    pub sort_by: ChangeSortField,
    pub descending: bool,
    /// 1-based
    pub page: usize,
    pub page_size: usize,
}

impl Default for ChangeQuery {
    fn default() -> Self {
        Self {
            change_type: None,
            outcome: None,
            source_master_action_id: None,
            from: None,
            to: None,
            text: None,
            sort_by: ChangeSortField::InitiatedAt,
            descending: true,
            page: 1,
            page_size: 20,
        }
    }
}

impl ChangeQuery {
    pub fn builder() -> ChangeQueryBuilder {
        ChangeQueryBuilder::default()
    }

    pub fn matches(&self, summary: &ChangeSummary) -> bool {
        if let Some(change_type) = self.change_type {
            if summary.change_type != change_type {
                return false;
            }
        }

        if let Some(outcome) = self.outcome {
            if summary.outcome != Some(outcome) {
                return false;
            }
        }

        if let Some(ref source) = self.source_master_action_id {
            if summary.source_master_action_id.as_ref() != Some(source) {
                return false;
            }
        }

        if let Some(from) = self.from {
            if summary.initiated_at < from {
                return false;
            }
        }

        if let Some(to) = self.to {
            if summary.initiated_at >= to {
                return false;
            }
        }

        if let Some(ref text) = self.text {
            let needle = text.to_lowercase();
            if !summary.description.to_lowercase().contains(&needle) {
                return false;
            }
        }

        true
    }

    /// Filter, sort and slice `summaries` into the requested page
    pub fn apply(&self, summaries: impl IntoIterator<Item = ChangeSummary>) -> Page<ChangeSummary> {
        let mut rows: Vec<ChangeSummary> =
            summaries.into_iter().filter(|s| self.matches(s)).collect();

        rows.sort_by(|a, b| {
            let ord = match self.sort_by {
                ChangeSortField::InitiatedAt => a.initiated_at.cmp(&b.initiated_at),
                // Pending changes sort after completed ones
                ChangeSortField::CompletedAt => match (a.completed_at, b.completed_at) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                },
                ChangeSortField::ChangeType => a
                    .change_type
                    .to_string()
                    .cmp(&b.change_type.to_string()),
            }
            .then_with(|| a.initiated_at.cmp(&b.initiated_at));
            if self.descending {
                ord.reverse()
            } else {
                ord
            }
        });

        let page = self.page.max(1);
        let page_size = self.page_size.max(1);
        let total = rows.len();
        let items = rows
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();

        Page {
            items,
            total,
            page,
            page_size,
        }
    }
}

/// Builder for [`ChangeQuery`]
#[derive(Debug, Default)]
pub struct ChangeQueryBuilder {
    query: ChangeQuery,
}

impl ChangeQueryBuilder {
    pub fn change_type(mut self, change_type: ChangeType) -> Self {
        self.query.change_type = Some(change_type);
        self
    }

    pub fn outcome(mut self, outcome: ChangeOutcome) -> Self {
        self.query.outcome = Some(outcome);
        self
    }

    pub fn source_master_action(mut self, id: MasterActionId) -> Self {
        self.query.source_master_action_id = Some(id);
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.query.from = Some(from);
        self.query.to = Some(to);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.query.text = Some(text.into());
        self
    }

    pub fn sort_by(mut self, field: ChangeSortField, descending: bool) -> Self {
        self.query.sort_by = field;
        self.query.descending = descending;
        self
    }

    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        self.query.page = page;
        self.query.page_size = page_size;
        self
    }

    pub fn build(self) -> ChangeQuery {
        self.query
    }
}

/// One page of a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Rows matching the filter across all pages
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}
