//! Journal facade bundling both logs and the shared id translator

use crate::action::{ActionJournal, FileActionJournal};
use crate::change::{ChangeJournal, FileChangeJournal};
use crate::config::JournalConfig;
use crate::error::Result;
use crate::layout::JournalLayout;
use crate::translator::ActionIdTranslator;
use fleet_types::{ChangeId, MasterActionId, NodeActionId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Records closed out by recovery
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub changes: Vec<ChangeId>,
    pub runs: Vec<MasterActionId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.runs.is_empty()
    }
}

/// Shared handle to the change journal, action journal and translator
#[derive(Clone)]
pub struct Journal {
    changes: Arc<dyn ChangeJournal>,
    actions: Arc<dyn ActionJournal>,
    translator: Arc<ActionIdTranslator>,
}

impl Journal {
    /// Open the file-backed journal under `config.root`
    pub async fn open(config: &JournalConfig) -> Result<Self> {
        let layout = JournalLayout::new(&config.root);
        let translator = Arc::new(ActionIdTranslator::new());

        let changes = FileChangeJournal::open(layout.clone(), config.sync_writes).await?;
        let actions = FileActionJournal::open(layout, config.sync_writes, translator.clone()).await?;

        let journal = Self::from_parts(Arc::new(changes), Arc::new(actions), translator);

        if config.recover_on_open {
            let report = journal.recover().await?;
            if !report.is_empty() {
                info!(
                    changes = report.changes.len(),
                    runs = report.runs.len(),
                    "Journal recovery closed out interrupted records"
                );
            }
        }

        Ok(journal)
    }

    /// Assemble a journal from arbitrary implementations.
    ///
    /// `translator` must be the one the action journal routes node logs with.
    pub fn from_parts(
        changes: Arc<dyn ChangeJournal>,
        actions: Arc<dyn ActionJournal>,
        translator: Arc<ActionIdTranslator>,
    ) -> Self {
        Self {
            changes,
            actions,
            translator,
        }
    }

    pub fn changes(&self) -> &dyn ChangeJournal {
        self.changes.as_ref()
    }

    pub fn actions(&self) -> &dyn ActionJournal {
        self.actions.as_ref()
    }

    pub fn translator(&self) -> &ActionIdTranslator {
        &self.translator
    }

    /// Typed result of a stage
    pub async fn stage_result<T: DeserializeOwned>(
        &self,
        id: &MasterActionId,
        stage_index: usize,
    ) -> Result<Option<T>> {
        match self.actions.get_stage_result_value(id, stage_index).await? {
            Some(envelope) => Ok(Some(serde_json::from_value(envelope.result)?)),
            None => Ok(None),
        }
    }

    /// Entry point for log lines arriving from remote agents
    pub async fn ingest_node_log(
        &self,
        node_action_id: &NodeActionId,
        node_name: &str,
        line: &str,
    ) -> Result<bool> {
        self.actions.append_node_log(node_action_id, node_name, line).await
    }

    /// Drop every in-memory mapping held for a finished run
    pub fn purge_run(&self, id: &MasterActionId) {
        let removed = self.translator.unregister_all_for_master_action(id);
        self.actions.forget_master_action(id);
        self.changes.forget_master_action(id);
        debug!(master_action_id = %id, removed, "Run mappings purged");
    }

    /// Close out records left open by a previous process
    pub async fn recover(&self) -> Result<RecoveryReport> {
        Ok(RecoveryReport {
            changes: self.changes.recover_interrupted().await?,
            runs: self.actions.recover_interrupted().await?,
        })
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("translated_node_actions", &self.translator.len())
            .finish()
    }
}
