//! Strongly-typed identifiers for control plane entities
//!
//! Workflow, node-action and task ids are prefixed strings so they stay
//! readable in logs and on disk; change ids are bare UUIDs.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a master action (`ma-<uuid>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MasterActionId(String);

impl MasterActionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("ma-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Usable as a single path component: non-empty ASCII alphanumerics, `-` and `_`
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }
}

impl fmt::Display for MasterActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a change journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(Uuid);

impl ChangeId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chg-{}", self.0)
    }
}

/// Identifier of a per-stage sub-action sent to the fleet.
///
/// This is the only id a remote agent ever learns about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeActionId(String);

impl NodeActionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("na-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique id of a single node task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("task-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_action_id_generation() {
        let id1 = MasterActionId::generate();
        let id2 = MasterActionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("ma-"));
        assert!(id1.is_path_safe());
    }

    #[test]
    fn test_path_unsafe_master_action_ids() {
        assert!(!MasterActionId::new("").is_path_safe());
        assert!(!MasterActionId::new("..").is_path_safe());
        assert!(!MasterActionId::new("ma-1/../ma-2").is_path_safe());
        assert!(!MasterActionId::new("ma-1\\x").is_path_safe());
    }

    #[test]
    fn test_change_id_display() {
        let id = ChangeId::generate();
        assert!(id.to_string().starts_with("chg-"));
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = NodeActionId::new("na-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"na-1\"");
    }
}
