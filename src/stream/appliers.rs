//! Event appliers.

use std::collections::HashMap;

use tracing::trace;

use super::Result;
use crate::protocol::{Intent, RecordValue, ValueType};
use crate::state::Transaction;

/// Applies one kind of event to state.
pub trait EventApplier: Send + Sync {
    fn apply(&self, tx: &mut Transaction<'_>, key: i64, value: &RecordValue) -> Result<()>;
}

impl<F> EventApplier for F
where
    F: Fn(&mut Transaction<'_>, i64, &RecordValue) -> Result<()> + Send + Sync,
{
    fn apply(&self, tx: &mut Transaction<'_>, key: i64, value: &RecordValue) -> Result<()> {
        self(tx, key, value)
    }
}

/// Event appliers keyed by `(value type, intent)`.
///
/// Events without an applier leave state untouched.
#[derive(Default)]
pub struct EventAppliers {
    appliers: HashMap<(ValueType, Intent), Box<dyn EventApplier>>,
}

impl EventAppliers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        value_type: ValueType,
        intent: Intent,
        applier: impl EventApplier + 'static,
    ) -> &mut Self {
        self.appliers.insert((value_type, intent), Box::new(applier));
        self
    }

    pub fn apply(
        &self,
        tx: &mut Transaction<'_>,
        key: i64,
        intent: Intent,
        value: &RecordValue,
    ) -> Result<()> {
        match self.appliers.get(&(value.value_type(), intent)) {
            Some(applier) => applier.apply(tx, key, value),
            None => {
                trace!(value_type = ?value.value_type(), ?intent, "No applier for event");
                Ok(())
            }
        }
    }
}
