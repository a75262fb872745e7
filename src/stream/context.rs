//! Per-command processing context.

use super::{EventAppliers, Result};
use crate::protocol::{Intent, Record, RecordValue, RejectionType};
use crate::state::{KeyGenerator, Transaction};

/// Everything a processor may touch while handling one command.
///
/// Appended events are applied to the transaction immediately, so later
/// reads in the same command observe them. Nothing leaves the context until
/// the stream processor commits.
pub struct ProcessingContext<'a> {
    tx: Transaction<'a>,
    appliers: &'a EventAppliers,
    key_generator: KeyGenerator,
    follow_ups: Vec<Record>,
    response: Option<Record>,
}

impl<'a> ProcessingContext<'a> {
    pub fn new(tx: Transaction<'a>, appliers: &'a EventAppliers, key_generator: KeyGenerator) -> Self {
        Self {
            tx,
            appliers,
            key_generator,
            follow_ups: Vec::new(),
            response: None,
        }
    }

    /// Read access to state, including this command's own writes.
    pub fn state(&self) -> &Transaction<'a> {
        &self.tx
    }

    pub fn next_key(&mut self) -> Result<i64> {
        Ok(self.key_generator.next_key(&mut self.tx)?)
    }

    /// Append an event and apply it to state.
    pub fn append_event(&mut self, key: i64, intent: Intent, value: RecordValue) -> Result<()> {
        self.appliers.apply(&mut self.tx, key, intent, &value)?;
        self.follow_ups.push(Record::event(key, intent, value));
        Ok(())
    }

    /// Append a command for a later processing step.
    pub fn append_command(&mut self, key: i64, intent: Intent, value: RecordValue) {
        self.follow_ups.push(Record::command(key, intent, value));
    }

    /// Reject `command` and answer its request, if any.
    pub fn reject(&mut self, command: &Record, rejection_type: RejectionType, reason: impl Into<String>) {
        let rejection = Record::rejection(command, rejection_type, &reason.into());
        self.response = Some(rejection.clone());
        self.follow_ups.push(rejection);
    }

    /// Answer the command's request with an event.
    pub fn respond(&mut self, key: i64, intent: Intent, value: RecordValue) {
        self.response = Some(Record::event(key, intent, value));
    }

    pub fn follow_ups(&self) -> &[Record] {
        &self.follow_ups
    }

    pub fn is_rejected(&self) -> bool {
        self.follow_ups
            .iter()
            .any(|r| r.metadata.rejection_type.is_some())
    }

    pub(crate) fn into_parts(self) -> (Transaction<'a>, Vec<Record>, Option<Record>) {
        (self.tx, self.follow_ups, self.response)
    }
}
