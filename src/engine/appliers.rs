//! Event appliers of the engine.

use super::state::{ElementInstance, ElementInstanceState, ElementLifecycle, ProcessState, StoredVariable, VariableState};
use crate::protocol::{Intent, ProcessInstanceRecord, RecordValue, ValueType, NO_KEY};
use crate::state::Transaction;
use crate::stream::{EventAppliers, ProcessingError, Result};

pub(crate) fn register(appliers: &mut EventAppliers) {
    appliers
        .register(ValueType::Process, Intent::Created, process_created)
        .register(ValueType::ProcessInstance, Intent::ElementActivating, element_activating)
        .register(ValueType::ProcessInstance, Intent::ElementActivated, element_activated)
        .register(ValueType::ProcessInstance, Intent::ElementCompleting, element_completing)
        .register(ValueType::ProcessInstance, Intent::ElementTerminating, element_terminating)
        .register(ValueType::ProcessInstance, Intent::ElementCompleted, element_removed)
        .register(ValueType::ProcessInstance, Intent::ElementTerminated, element_removed)
        .register(ValueType::ProcessInstance, Intent::SequenceFlowTaken, sequence_flow_taken)
        .register(ValueType::Variable, Intent::Created, variable_set)
        .register(ValueType::Variable, Intent::Updated, variable_set);
}

fn instance_record(value: &RecordValue) -> Result<&ProcessInstanceRecord> {
    match value {
        RecordValue::ProcessInstance(record) => Ok(record),
        other => Err(ProcessingError::UnexpectedValue {
            expected: ValueType::ProcessInstance,
            actual: other.value_type(),
        }),
    }
}

fn process_created(tx: &mut Transaction<'_>, _key: i64, value: &RecordValue) -> Result<()> {
    if let RecordValue::Process(process) = value {
        ProcessState::put(tx, process)?;
    }
    Ok(())
}

fn element_activating(tx: &mut Transaction<'_>, key: i64, value: &RecordValue) -> Result<()> {
    let record = instance_record(value)?;
    let instance = ElementInstance {
        key,
        lifecycle: ElementLifecycle::Activating,
        record: ProcessInstanceRecord {
            via_sequence_flow: false,
            ..record.clone()
        },
        active_children: 0,
        active_sequence_flows: 0,
        finished_children: 0,
    };
    ElementInstanceState::put(tx, &instance)?;

    if record.flow_scope_key == NO_KEY {
        return Ok(());
    }
    ElementInstanceState::add_child(tx, record.flow_scope_key, key);
    if let Some(mut scope) = ElementInstanceState::get(tx, record.flow_scope_key)? {
        scope.active_children += 1;
        if record.via_sequence_flow {
            scope.active_sequence_flows = (scope.active_sequence_flows - 1).max(0);
        }
        ElementInstanceState::put(tx, &scope)?;
    }
    Ok(())
}

fn transition(tx: &mut Transaction<'_>, key: i64, lifecycle: ElementLifecycle) -> Result<()> {
    if let Some(mut instance) = ElementInstanceState::get(tx, key)? {
        instance.lifecycle = lifecycle;
        ElementInstanceState::put(tx, &instance)?;
    }
    Ok(())
}

fn element_activated(tx: &mut Transaction<'_>, key: i64, _value: &RecordValue) -> Result<()> {
    transition(tx, key, ElementLifecycle::Activated)
}

fn element_completing(tx: &mut Transaction<'_>, key: i64, _value: &RecordValue) -> Result<()> {
    transition(tx, key, ElementLifecycle::Completing)
}

fn element_terminating(tx: &mut Transaction<'_>, key: i64, _value: &RecordValue) -> Result<()> {
    transition(tx, key, ElementLifecycle::Terminating)
}

/// Completed and terminated instances leave state together with their
/// local variables.
fn element_removed(tx: &mut Transaction<'_>, key: i64, value: &RecordValue) -> Result<()> {
    let record = instance_record(value)?;
    ElementInstanceState::remove(tx, key, record.flow_scope_key);
    VariableState::remove_scope(tx, key);

    if record.flow_scope_key != NO_KEY {
        if let Some(mut scope) = ElementInstanceState::get(tx, record.flow_scope_key)? {
            scope.active_children = (scope.active_children - 1).max(0);
            scope.finished_children += 1;
            ElementInstanceState::put(tx, &scope)?;
        }
    }
    Ok(())
}

fn sequence_flow_taken(tx: &mut Transaction<'_>, _key: i64, value: &RecordValue) -> Result<()> {
    let record = instance_record(value)?;
    if let Some(mut scope) = ElementInstanceState::get(tx, record.flow_scope_key)? {
        scope.active_sequence_flows += 1;
        ElementInstanceState::put(tx, &scope)?;
    }
    Ok(())
}

fn variable_set(tx: &mut Transaction<'_>, key: i64, value: &RecordValue) -> Result<()> {
    if let RecordValue::Variable(variable) = value {
        VariableState::put(
            tx,
            variable.scope_key,
            &variable.name,
            &StoredVariable {
                key,
                value: variable.value.clone(),
            },
        )?;
    }
    Ok(())
}
