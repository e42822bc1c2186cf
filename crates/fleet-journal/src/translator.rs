//! Node action id translation
//!
//! Remote agents only ever learn the id of the node action they execute.
//! Output they send back is attributed to its workflow through this map.

use dashmap::DashMap;
use fleet_types::{MasterActionId, NodeActionId};
use tracing::debug;

/// Thread-safe map from node action ids to their owning master action
#[derive(Debug, Default)]
pub struct ActionIdTranslator {
    mappings: DashMap<NodeActionId, MasterActionId>,
}

impl ActionIdTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the mapping for `node_action_id`
    pub fn register_mapping(&self, node_action_id: NodeActionId, master_action_id: MasterActionId) {
        self.mappings.insert(node_action_id, master_action_id);
    }

    pub fn translate_node_action_id_to_master_action_id(
        &self,
        node_action_id: &NodeActionId,
    ) -> Option<MasterActionId> {
        self.mappings.get(node_action_id).map(|m| m.clone())
    }

    /// Drop every mapping pointing at `master_action_id`
    pub fn unregister_all_for_master_action(&self, master_action_id: &MasterActionId) -> usize {
        let before = self.mappings.len();
        self.mappings.retain(|_, owner| owner != master_action_id);
        let removed = before.saturating_sub(self.mappings.len());
        debug!(%master_action_id, removed, "Unregistered node action mappings");
        removed
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
