//! One-time state migrations.
//!
//! Run by the stream processor before the first record after a (re)start.
//! Each task runs in its own transaction. An abort stops the sequence before
//! the next task; a task already running finishes and commits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::{ColumnFamily, Db, StateError, Transaction};

/// Result type for migrations.
pub type Result<T> = std::result::Result<T, MigrationError>;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Migration '{identifier}' failed: {reason}")]
    Failed { identifier: String, reason: String },
}

/// A one-time upgrade of persisted state.
pub trait MigrationTask: Send + Sync {
    /// Stable name, recorded once the task finished.
    fn identifier(&self) -> &str;

    fn needs_to_run(&self, tx: &Transaction<'_>) -> Result<bool>;

    fn run_migration(&self, tx: &mut Transaction<'_>) -> Result<()>;
}

/// Record of finished migrations.
pub struct MigrationState;

impl MigrationState {
    pub fn is_finished(tx: &Transaction<'_>, identifier: &str) -> bool {
        tx.exists(ColumnFamily::Migrations, identifier.as_bytes())
    }

    pub fn mark_finished(tx: &mut Transaction<'_>, identifier: &str) {
        tx.put(ColumnFamily::Migrations, identifier.as_bytes(), Vec::new());
    }
}

/// Runs migration tasks in order.
pub struct DbMigrator {
    tasks: Vec<Box<dyn MigrationTask>>,
    abort: Arc<AtomicBool>,
}

impl DbMigrator {
    pub fn new(tasks: Vec<Box<dyn MigrationTask>>) -> Self {
        Self {
            tasks,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop before the next task starts.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    /// Shared abort flag, for signalling from another task.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Run every task that needs to run. Returns how many ran.
    pub fn run_migrations(&self, db: &mut Db) -> Result<usize> {
        let mut executed = 0;

        for task in &self.tasks {
            if self.is_aborted() {
                info!(
                    next = task.identifier(),
                    executed, "Migrations aborted before completion"
                );
                break;
            }

            let mut tx = db.transaction();
            if !task.needs_to_run(&tx)? {
                debug!(migration = task.identifier(), "Migration not needed");
                continue;
            }

            info!(migration = task.identifier(), "Running migration");
            task.run_migration(&mut tx)?;
            MigrationState::mark_finished(&mut tx, task.identifier());
            tx.commit();
            executed += 1;
        }

        Ok(executed)
    }
}
