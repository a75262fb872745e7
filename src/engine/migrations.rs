//! State migrations owned by the engine.

use tracing::info;

use super::state::ElementInstanceState;
use crate::protocol::NO_KEY;
use crate::state::migration::{MigrationState, MigrationTask, Result};
use crate::state::Transaction;

/// Rebuilds the parent-to-child index of element instances, for state
/// written before the index existed.
pub struct ElementInstanceChildIndexMigration;

impl ElementInstanceChildIndexMigration {
    pub const IDENTIFIER: &'static str = "element-instance-child-index";

    fn missing_entries(tx: &Transaction<'_>) -> Result<Vec<(i64, i64)>> {
        Ok(ElementInstanceState::all(tx)?
            .into_iter()
            .filter(|instance| instance.record.flow_scope_key != NO_KEY)
            .map(|instance| (instance.record.flow_scope_key, instance.key))
            .filter(|(parent, child)| !ElementInstanceState::has_child(tx, *parent, *child))
            .collect())
    }
}

impl MigrationTask for ElementInstanceChildIndexMigration {
    fn identifier(&self) -> &str {
        Self::IDENTIFIER
    }

    fn needs_to_run(&self, tx: &Transaction<'_>) -> Result<bool> {
        if MigrationState::is_finished(tx, Self::IDENTIFIER) {
            return Ok(false);
        }
        Ok(!Self::missing_entries(tx)?.is_empty())
    }

    fn run_migration(&self, tx: &mut Transaction<'_>) -> Result<()> {
        let missing = Self::missing_entries(tx)?;
        info!(entries = missing.len(), "Rebuilding element instance child index");
        for (parent, child) in missing {
            ElementInstanceState::add_child(tx, parent, child);
        }
        Ok(())
    }
}
