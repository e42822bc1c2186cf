//! Journal configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where and how the journal persists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Root directory holding `changes/` and `actions/`
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// fsync every append and artifact write
    #[serde(default = "default_true")]
    pub sync_writes: bool,

    /// Close out records left open by a previous process on open
    #[serde(default = "default_true")]
    pub recover_on_open: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            sync_writes: true,
            recover_on_open: true,
        }
    }
}

impl JournalConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./journal")
}

fn default_true() -> bool {
    true
}
