//! Element lifecycle steps shared by the engine's processors.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::model::{BpmnElementType, ExecutableElement, ExecutableProcess, ExecutableSequenceFlow};
use super::state::{ElementInstance, ElementInstanceState, ProcessState, VariableState};
use crate::protocol::{Intent, ProcessInstanceRecord, Record, RecordValue, ValueType, VariableRecord, NO_KEY};
use crate::state::Transaction;
use crate::stream::{ProcessingContext, ProcessingError, Result};

/// Executable processes by definition key, built on first use.
///
/// Deployed versions never change, so entries never go stale.
#[derive(Default)]
pub(crate) struct ProcessCache {
    processes: DashMap<i64, Arc<ExecutableProcess>>,
}

impl ProcessCache {
    pub(crate) fn get(&self, tx: &Transaction<'_>, key: i64) -> Result<Option<Arc<ExecutableProcess>>> {
        if let Some(process) = self.processes.get(&key) {
            return Ok(Some(process.value().clone()));
        }
        let Some(record) = ProcessState::by_key(tx, key)? else {
            return Ok(None);
        };
        let process = ExecutableProcess::new(&record.definition).map_err(|e| {
            ProcessingError::InconsistentState(format!("deployed process {key} is invalid: {e}"))
        })?;
        let process = Arc::new(process);
        self.processes.insert(key, Arc::clone(&process));
        Ok(Some(process))
    }

    /// Like [`ProcessCache::get`], for records that must reference a
    /// deployed process.
    pub(crate) fn require(&self, tx: &Transaction<'_>, key: i64) -> Result<Arc<ExecutableProcess>> {
        self.get(tx, key)?.ok_or_else(|| {
            ProcessingError::InconsistentState(format!("no deployed process with key {key}"))
        })
    }
}

pub(crate) fn instance_value(command: &Record) -> Result<&ProcessInstanceRecord> {
    match &command.value {
        RecordValue::ProcessInstance(record) => Ok(record),
        other => Err(ProcessingError::UnexpectedValue {
            expected: ValueType::ProcessInstance,
            actual: other.value_type(),
        }),
    }
}

/// Record for an instance of `element` inside `flow_scope_key`, in the same
/// process instance as `base`.
pub(crate) fn child_record(
    base: &ProcessInstanceRecord,
    element: &ExecutableElement,
    flow_scope_key: i64,
) -> ProcessInstanceRecord {
    ProcessInstanceRecord {
        element_id: element.id.clone(),
        bpmn_element_type: element.element_type,
        flow_scope_key,
        via_sequence_flow: false,
        ..base.clone()
    }
}

fn lifecycle(ctx: &mut ProcessingContext<'_>, key: i64, intent: Intent, record: &ProcessInstanceRecord) -> Result<()> {
    ctx.append_event(key, intent, RecordValue::ProcessInstance(record.clone()))
}

/// Activate an element instance and run it as far as it goes without
/// waiting.
pub(crate) fn activate_element(
    ctx: &mut ProcessingContext<'_>,
    process: &ExecutableProcess,
    key: i64,
    record: &ProcessInstanceRecord,
) -> Result<()> {
    let element = process
        .element_for(&record.element_id, record.bpmn_element_type)
        .ok_or_else(|| {
            ProcessingError::InconsistentState(format!(
                "process '{}' has no element '{}'",
                process.bpmn_process_id(),
                record.element_id
            ))
        })?;

    lifecycle(ctx, key, Intent::ElementActivating, record)?;
    let record = ProcessInstanceRecord {
        via_sequence_flow: false,
        ..record.clone()
    };
    lifecycle(ctx, key, Intent::ElementActivated, &record)?;

    match element.element_type {
        BpmnElementType::Process | BpmnElementType::SubProcess => {
            let start_event = process.start_event(&element.id).ok_or_else(|| {
                ProcessingError::InconsistentState(format!("'{}' has no start event", element.id))
            })?;
            let child_key = ctx.next_key()?;
            ctx.append_command(
                child_key,
                Intent::ActivateElement,
                RecordValue::ProcessInstance(child_record(&record, start_event, key)),
            );
        }
        BpmnElementType::MultiInstanceBody => {
            let inner = process.inner_activity(&element.id).ok_or_else(|| {
                ProcessingError::InconsistentState(format!("'{}' has no inner activity", element.id))
            })?;
            let cardinality = element.cardinality.unwrap_or(0);
            if cardinality == 0 {
                return complete_element(ctx, process, key, &record);
            }
            for _ in 0..cardinality {
                let child_key = ctx.next_key()?;
                ctx.append_command(
                    child_key,
                    Intent::ActivateElement,
                    RecordValue::ProcessInstance(child_record(&record, inner, key)),
                );
            }
        }
        element_type if element_type.is_wait_state() => {
            debug!(key, element_id = %element.id, "Element waiting");
        }
        _ => complete_element(ctx, process, key, &record)?,
    }
    Ok(())
}

/// Complete an element instance, continue on its outgoing flows and
/// complete the flow scope once nothing is left in it.
pub(crate) fn complete_element(
    ctx: &mut ProcessingContext<'_>,
    process: &ExecutableProcess,
    key: i64,
    record: &ProcessInstanceRecord,
) -> Result<()> {
    lifecycle(ctx, key, Intent::ElementCompleting, record)?;
    lifecycle(ctx, key, Intent::ElementCompleted, record)?;

    if let Some(element) = process.element_for(&record.element_id, record.bpmn_element_type) {
        let flows = select_outgoing(ctx.state(), process, element, record.flow_scope_key)?;
        for flow in flows {
            take_sequence_flow(ctx, process, record, flow)?;
        }
    }

    if record.flow_scope_key == NO_KEY {
        return Ok(());
    }
    match ElementInstanceState::get(ctx.state(), record.flow_scope_key)? {
        Some(scope)
            if scope.is_active() && scope.is_idle() && spawned_all_finished(process, &scope) =>
        {
            complete_element(ctx, process, scope.key, &scope.record)
        }
        _ => Ok(()),
    }
}

/// A multi-instance body activates its inner instances through commands, so
/// it looks idle between them. It is done once all of them finished.
fn spawned_all_finished(process: &ExecutableProcess, scope: &ElementInstance) -> bool {
    if scope.record.bpmn_element_type != BpmnElementType::MultiInstanceBody {
        return true;
    }
    let cardinality = process
        .element_for(&scope.record.element_id, scope.record.bpmn_element_type)
        .and_then(|body| body.cardinality)
        .unwrap_or(0);
    i64::from(scope.finished_children) >= i64::from(cardinality)
}

fn select_outgoing<'p>(
    tx: &Transaction<'_>,
    process: &'p ExecutableProcess,
    element: &'p ExecutableElement,
    scope_key: i64,
) -> Result<Vec<&'p ExecutableSequenceFlow>> {
    match element.element_type {
        BpmnElementType::ExclusiveGateway => {
            for flow in process.outgoing(element) {
                let Some(condition) = &flow.condition else {
                    continue;
                };
                let value = VariableState::visible(tx, scope_key, &condition.variable)?;
                if value.as_ref() == Some(&condition.equals) {
                    return Ok(vec![flow]);
                }
            }
            let default_flow = element
                .default_flow
                .as_deref()
                .and_then(|id| process.sequence_flow(id));
            match default_flow {
                Some(flow) => Ok(vec![flow]),
                None if element.outgoing.is_empty() => Ok(Vec::new()),
                None => Err(ProcessingError::Failed(format!(
                    "Expected at least one condition of exclusive gateway '{}' to evaluate to true, or to have a default flow",
                    element.id
                ))),
            }
        }
        BpmnElementType::EventBasedGateway => Ok(process.outgoing(element).take(1).collect()),
        _ => Ok(process.outgoing(element).collect()),
    }
}

fn take_sequence_flow(
    ctx: &mut ProcessingContext<'_>,
    process: &ExecutableProcess,
    record: &ProcessInstanceRecord,
    flow: &ExecutableSequenceFlow,
) -> Result<()> {
    let target = process.element(&flow.target).ok_or_else(|| {
        ProcessingError::InconsistentState(format!("sequence flow '{}' has no target", flow.id))
    })?;

    let flow_key = ctx.next_key()?;
    let flow_record = ProcessInstanceRecord {
        element_id: flow.id.clone(),
        bpmn_element_type: BpmnElementType::SequenceFlow,
        via_sequence_flow: false,
        ..record.clone()
    };
    lifecycle(ctx, flow_key, Intent::SequenceFlowTaken, &flow_record)?;

    let target_key = ctx.next_key()?;
    let target_record = ProcessInstanceRecord {
        via_sequence_flow: true,
        ..child_record(record, target, record.flow_scope_key)
    };
    ctx.append_command(
        target_key,
        Intent::ActivateElement,
        RecordValue::ProcessInstance(target_record),
    );
    Ok(())
}

/// Terminate an element instance and, depth-first, everything below it.
pub(crate) fn terminate_element(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> Result<()> {
    lifecycle(ctx, instance.key, Intent::ElementTerminating, &instance.record)?;
    for child in ElementInstanceState::children(ctx.state(), instance.key)? {
        terminate_element(ctx, &child)?;
    }
    lifecycle(ctx, instance.key, Intent::ElementTerminated, &instance.record)
}

/// Create or update variables on `scope_key`. Unchanged values write
/// nothing.
pub(crate) fn set_variables(
    ctx: &mut ProcessingContext<'_>,
    scope_key: i64,
    instance: &ProcessInstanceRecord,
    variables: &BTreeMap<String, serde_json::Value>,
) -> Result<()> {
    for (name, value) in variables {
        let existing = VariableState::get(ctx.state(), scope_key, name)?;
        let (key, intent) = match existing {
            Some(existing) if &existing.value == value => continue,
            Some(existing) => (existing.key, Intent::Updated),
            None => (ctx.next_key()?, Intent::Created),
        };
        ctx.append_event(
            key,
            intent,
            RecordValue::Variable(VariableRecord {
                name: name.clone(),
                value: value.clone(),
                scope_key,
                process_instance_key: instance.process_instance_key,
                process_definition_key: instance.process_definition_key,
                bpmn_process_id: instance.bpmn_process_id.clone(),
            }),
        )?;
    }
    Ok(())
}
