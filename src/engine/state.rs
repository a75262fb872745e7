//! Engine state: element instances, deployed processes and variables.
//!
//! All functions read and write through a [`Transaction`]; only event
//! appliers call the mutating ones.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::protocol::{ProcessInstanceRecord, ProcessRecord, NO_KEY};
use crate::state::{
    composite_long_key, long_key, long_string_key, read_long_key, ColumnFamily, Result, Transaction,
};

// ============================================================================
// Element instances
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElementLifecycle {
    Activating,
    Activated,
    Completing,
    Terminating,
}

/// A live element instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementInstance {
    pub key: i64,
    pub lifecycle: ElementLifecycle,
    pub record: ProcessInstanceRecord,
    /// Child element instances not yet completed or terminated.
    pub active_children: i32,
    /// Sequence flows taken inside this scope whose target is not activated
    /// yet.
    pub active_sequence_flows: i32,
    /// Child element instances completed or terminated so far.
    #[serde(default)]
    pub finished_children: i32,
}

impl ElementInstance {
    pub fn is_active(&self) -> bool {
        self.lifecycle == ElementLifecycle::Activated
    }

    /// No child instance and no sequence flow in flight.
    pub fn is_idle(&self) -> bool {
        self.active_children == 0 && self.active_sequence_flows == 0
    }
}

pub struct ElementInstanceState;

impl ElementInstanceState {
    pub fn get(tx: &Transaction<'_>, key: i64) -> Result<Option<ElementInstance>> {
        tx.get_value(ColumnFamily::ElementInstanceKey, &long_key(key))
    }

    pub fn put(tx: &mut Transaction<'_>, instance: &ElementInstance) -> Result<()> {
        tx.put_value(ColumnFamily::ElementInstanceKey, &long_key(instance.key), instance)
    }

    /// Remove an instance and its entry in the parent's child index.
    pub fn remove(tx: &mut Transaction<'_>, key: i64, flow_scope_key: i64) {
        tx.delete(ColumnFamily::ElementInstanceKey, &long_key(key));
        if flow_scope_key != NO_KEY {
            tx.delete(
                ColumnFamily::ElementInstanceChildParent,
                &composite_long_key(flow_scope_key, key),
            );
        }
    }

    pub fn add_child(tx: &mut Transaction<'_>, flow_scope_key: i64, key: i64) {
        tx.put(
            ColumnFamily::ElementInstanceChildParent,
            &composite_long_key(flow_scope_key, key),
            Vec::new(),
        );
    }

    pub fn has_child(tx: &Transaction<'_>, flow_scope_key: i64, key: i64) -> bool {
        tx.exists(
            ColumnFamily::ElementInstanceChildParent,
            &composite_long_key(flow_scope_key, key),
        )
    }

    /// Children of `flow_scope_key`, oldest first.
    pub fn children(tx: &Transaction<'_>, flow_scope_key: i64) -> Result<Vec<ElementInstance>> {
        let mut children = Vec::new();
        for (key, _) in tx.prefix_scan(ColumnFamily::ElementInstanceChildParent, &long_key(flow_scope_key)) {
            let Some(child_key) = key.get(8..).and_then(read_long_key) else {
                continue;
            };
            if let Some(child) = Self::get(tx, child_key)? {
                children.push(child);
            }
        }
        Ok(children)
    }

    /// Every live element instance, by key.
    pub fn all(tx: &Transaction<'_>) -> Result<Vec<ElementInstance>> {
        tx.prefix_scan(ColumnFamily::ElementInstanceKey, &[])
            .into_iter()
            .map(|(_, bytes)| Ok(serde_json::from_slice(&bytes)?))
            .collect()
    }
}

// ============================================================================
// Processes
// ============================================================================

pub struct ProcessState;

impl ProcessState {
    pub fn put(tx: &mut Transaction<'_>, process: &ProcessRecord) -> Result<()> {
        tx.put_value(ColumnFamily::ProcessCacheByKey, &long_key(process.key), process)?;
        tx.put_value(
            ColumnFamily::ProcessCacheByIdAndVersion,
            &id_version_key(&process.bpmn_process_id, process.version),
            &process.key,
        )?;

        let latest = Self::latest_version(tx, &process.bpmn_process_id)?.unwrap_or(0);
        if process.version > latest {
            tx.put_value(
                ColumnFamily::ProcessLatestVersion,
                process.bpmn_process_id.as_bytes(),
                &process.version,
            )?;
        }
        Ok(())
    }

    pub fn by_key(tx: &Transaction<'_>, key: i64) -> Result<Option<ProcessRecord>> {
        tx.get_value(ColumnFamily::ProcessCacheByKey, &long_key(key))
    }

    pub fn latest_version(tx: &Transaction<'_>, bpmn_process_id: &str) -> Result<Option<i32>> {
        tx.get_value(ColumnFamily::ProcessLatestVersion, bpmn_process_id.as_bytes())
    }

    pub fn by_id_and_version(
        tx: &Transaction<'_>,
        bpmn_process_id: &str,
        version: i32,
    ) -> Result<Option<ProcessRecord>> {
        let key: Option<i64> = tx.get_value(
            ColumnFamily::ProcessCacheByIdAndVersion,
            &id_version_key(bpmn_process_id, version),
        )?;
        match key {
            Some(key) => Self::by_key(tx, key),
            None => Ok(None),
        }
    }

    pub fn latest(tx: &Transaction<'_>, bpmn_process_id: &str) -> Result<Option<ProcessRecord>> {
        match Self::latest_version(tx, bpmn_process_id)? {
            Some(version) => Self::by_id_and_version(tx, bpmn_process_id, version),
            None => Ok(None),
        }
    }
}

fn id_version_key(bpmn_process_id: &str, version: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(bpmn_process_id.len() + 9);
    key.extend_from_slice(bpmn_process_id.as_bytes());
    key.push(0);
    key.extend_from_slice(&long_key(version as i64));
    key
}

// ============================================================================
// Variables
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVariable {
    pub key: i64,
    pub value: serde_json::Value,
}

pub struct VariableState;

impl VariableState {
    pub fn get(tx: &Transaction<'_>, scope_key: i64, name: &str) -> Result<Option<StoredVariable>> {
        tx.get_value(ColumnFamily::Variables, &long_string_key(scope_key, name))
    }

    pub fn put(
        tx: &mut Transaction<'_>,
        scope_key: i64,
        name: &str,
        variable: &StoredVariable,
    ) -> Result<()> {
        tx.put_value(ColumnFamily::Variables, &long_string_key(scope_key, name), variable)
    }

    /// Variables defined directly on `scope_key`, by name.
    pub fn local(tx: &Transaction<'_>, scope_key: i64) -> Result<BTreeMap<String, serde_json::Value>> {
        let mut variables = BTreeMap::new();
        for (key, bytes) in tx.prefix_scan(ColumnFamily::Variables, &long_key(scope_key)) {
            let name = String::from_utf8_lossy(&key[8..]).into_owned();
            let stored: StoredVariable = serde_json::from_slice(&bytes)?;
            variables.insert(name, stored.value);
        }
        Ok(variables)
    }

    /// Variable visible from `scope_key`: the nearest definition walking up
    /// the flow scopes.
    pub fn visible(
        tx: &Transaction<'_>,
        scope_key: i64,
        name: &str,
    ) -> Result<Option<serde_json::Value>> {
        let mut current = scope_key;
        while current != NO_KEY {
            if let Some(variable) = Self::get(tx, current, name)? {
                return Ok(Some(variable.value));
            }
            current = match ElementInstanceState::get(tx, current)? {
                Some(instance) => instance.record.flow_scope_key,
                None => NO_KEY,
            };
        }
        Ok(None)
    }

    pub fn remove_scope(tx: &mut Transaction<'_>, scope_key: i64) {
        for (key, _) in tx.prefix_scan(ColumnFamily::Variables, &long_key(scope_key)) {
            tx.delete(ColumnFamily::Variables, &key);
        }
    }
}
