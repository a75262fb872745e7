//! Process instance modification.
//!
//! Activates arbitrary elements of a running process instance and
//! terminates arbitrary element instances of it, in one step. Activation
//! reuses or creates the flow scope instances on the way down to the
//! element. Termination cascades upwards: a flow scope left without active
//! children and without sequence flows in flight is terminated too.
//!
//! The command is validated as a whole before anything is written. Every
//! failed check rejects the command with a message naming all offending
//! instructions.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use super::behavior::{self, ProcessCache};
use super::model::{BpmnElementType, ExecutableElement, ExecutableProcess};
use super::state::{ElementInstance, ElementInstanceState};
use crate::protocol::{
    ActivateInstruction, Intent, ProcessInstanceModificationRecord, Record, RecordValue,
    RejectionType, ValueType, NO_KEY,
};
use crate::state::Transaction;
use crate::stream::{ProcessingContext, ProcessingError, Result, TypedRecordProcessor};

/// Element types that cannot be activated by a modification.
const UNSUPPORTED_ELEMENT_TYPES: [BpmnElementType; 4] = [
    BpmnElementType::Unspecified,
    BpmnElementType::StartEvent,
    BpmnElementType::SequenceFlow,
    BpmnElementType::BoundaryEvent,
];

/// A failed validation.
#[derive(Debug, Clone, PartialEq)]
struct Rejection {
    rejection_type: RejectionType,
    reason: String,
}

impl Rejection {
    fn invalid(reason: String) -> Self {
        Self {
            rejection_type: RejectionType::InvalidArgument,
            reason,
        }
    }
}

fn supported_element_types() -> String {
    let supported: Vec<&str> = BpmnElementType::ALL
        .iter()
        .filter(|t| !UNSUPPORTED_ELEMENT_TYPES.contains(t))
        .map(BpmnElementType::as_str)
        .collect();
    format!("[{}]", supported.join(", "))
}

/// Distinct values in first-seen order.
fn distinct<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = BTreeSet::new();
    values.into_iter().filter(|v| seen.insert(*v)).collect()
}

pub(crate) struct ProcessInstanceModificationProcessor {
    processes: Arc<ProcessCache>,
}

impl ProcessInstanceModificationProcessor {
    pub(crate) fn new(processes: Arc<ProcessCache>) -> Self {
        Self { processes }
    }
}

impl TypedRecordProcessor for ProcessInstanceModificationProcessor {
    fn process_record(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<()> {
        let RecordValue::ProcessInstanceModification(modification) = &command.value else {
            return Err(ProcessingError::UnexpectedValue {
                expected: ValueType::ProcessInstanceModification,
                actual: command.value_type(),
            });
        };
        let process_instance_key = modification.process_instance_key;
        let event_key = if command.key > NO_KEY {
            command.key
        } else {
            process_instance_key
        };

        let process_instance = ElementInstanceState::get(ctx.state(), process_instance_key)?
            .filter(|instance| instance.record.bpmn_element_type == BpmnElementType::Process);
        let Some(process_instance) = process_instance else {
            ctx.reject(
                command,
                RejectionType::NotFound,
                format!(
                    "Expected to modify process instance but no process instance found with key '{event_key}'"
                ),
            );
            return Ok(());
        };

        let process = self
            .processes
            .require(ctx.state(), process_instance.record.process_definition_key)?;

        if let Err(rejection) = validate(ctx.state(), &process, &process_instance, modification)? {
            debug!(
                process_instance_key,
                reason = %rejection.reason,
                "Modification rejected"
            );
            ctx.reject(command, rejection.rejection_type, rejection.reason);
            return Ok(());
        }

        let mut activated_scopes = BTreeSet::new();
        for instruction in &modification.activate_instructions {
            for variables in &instruction.variable_instructions {
                if variables.element_id.is_empty() {
                    behavior::set_variables(
                        ctx,
                        process_instance.key,
                        &process_instance.record,
                        &variables.variables,
                    )?;
                } else {
                    debug!(
                        element_id = %variables.element_id,
                        "Element-local variable instructions are not applied"
                    );
                }
            }
            activated_scopes.extend(activate(ctx, &process, &process_instance, instruction)?);
        }

        for instruction in &modification.terminate_instructions {
            terminate(ctx, instruction.element_instance_key, &activated_scopes)?;
        }

        ctx.append_event(event_key, Intent::Modified, command.value.clone())?;
        ctx.respond(event_key, Intent::Modified, command.value.clone());
        Ok(())
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Outer error: state could not be read. Inner error: the command is
/// invalid.
fn validate(
    tx: &Transaction<'_>,
    process: &ExecutableProcess,
    process_instance: &ElementInstance,
    modification: &ProcessInstanceModificationRecord,
) -> Result<std::result::Result<(), Rejection>> {
    let process_id = process.bpmn_process_id();
    let activations = &modification.activate_instructions;

    let missing = distinct(
        activations
            .iter()
            .map(|i| i.element_id.as_str())
            .filter(|id| process.element(id).is_none()),
    );
    if !missing.is_empty() {
        return Ok(Err(Rejection::invalid(format!(
            "Expected to modify instance of process '{}' but it contains one or more activate instructions with an element that could not be found: '{}'",
            process_id,
            missing.join("', '")
        ))));
    }

    let elements: Vec<&ExecutableElement> = activations
        .iter()
        .filter_map(|i| process.element(&i.element_id))
        .collect();
    let unsupported = |ids: Vec<&str>, detail: String| {
        Rejection::invalid(format!(
            "Expected to modify instance of process '{}' but it contains one or more activate instructions for elements that are unsupported: '{}'. {}.",
            process_id,
            ids.join("', '"),
            detail
        ))
    };

    let gateway_targets = distinct(
        elements
            .iter()
            .filter(|e| e.connected_to_event_based_gateway)
            .map(|e| e.id.as_str()),
    );
    if !gateway_targets.is_empty() {
        return Ok(Err(unsupported(
            gateway_targets,
            "The activation of events belonging to an event-based gateway is not supported".to_string(),
        )));
    }

    let inside_multi_instance = distinct(
        elements
            .iter()
            .filter(|e| process.is_inside_multi_instance_body(&e.id))
            .map(|e| e.id.as_str()),
    );
    if !inside_multi_instance.is_empty() {
        return Ok(Err(unsupported(
            inside_multi_instance,
            "The activation of elements inside a multi-instance subprocess is not supported".to_string(),
        )));
    }

    let unsupported_elements: Vec<&&ExecutableElement> = elements
        .iter()
        .filter(|e| UNSUPPORTED_ELEMENT_TYPES.contains(&e.element_type))
        .collect();
    if !unsupported_elements.is_empty() {
        let ids = distinct(unsupported_elements.iter().map(|e| e.id.as_str()));
        let types = distinct(unsupported_elements.iter().map(|e| e.element_type.as_str()));
        return Ok(Err(unsupported(
            ids,
            format!(
                "The activation of elements with type '{}' is not supported. Supported element types are: {}",
                types.join("', '"),
                supported_element_types()
            ),
        )));
    }

    let mut invalid_ancestors = Vec::new();
    for instruction in activations {
        if instruction.ancestor_scope_key == NO_KEY {
            continue;
        }
        if !is_valid_ancestor(tx, process, process_instance, instruction)? {
            invalid_ancestors.push(instruction.ancestor_scope_key.to_string());
        }
    }
    if !invalid_ancestors.is_empty() {
        return Ok(Err(Rejection::invalid(format!(
            "Expected to modify instance of process '{}' but it contains one or more activate instructions with an ancestor scope key that does not exist, or is not in an active state: '{}'",
            process_id,
            distinct(invalid_ancestors.iter().map(String::as_str)).join("', '")
        ))));
    }

    let mut unknown_instances = Vec::new();
    for instruction in &modification.terminate_instructions {
        let key = instruction.element_instance_key;
        let belongs = ElementInstanceState::get(tx, key)?
            .is_some_and(|i| i.record.process_instance_key == process_instance.key);
        if !belongs {
            unknown_instances.push(key.to_string());
        }
    }
    if !unknown_instances.is_empty() {
        return Ok(Err(Rejection {
            rejection_type: RejectionType::NotFound,
            reason: format!(
                "Expected to modify instance of process '{}' but it contains one or more terminate instructions with an element instance that could not be found: '{}'",
                process_id,
                distinct(unknown_instances.iter().map(String::as_str)).join("', '")
            ),
        }));
    }

    Ok(Ok(()))
}

/// The ancestor must be an active instance of this process instance, and an
/// instance of one of the element's flow scopes.
fn is_valid_ancestor(
    tx: &Transaction<'_>,
    process: &ExecutableProcess,
    process_instance: &ElementInstance,
    instruction: &ActivateInstruction,
) -> Result<bool> {
    let Some(ancestor) = ElementInstanceState::get(tx, instruction.ancestor_scope_key)? else {
        return Ok(false);
    };
    let is_flow_scope = process
        .flow_scopes(&instruction.element_id)
        .iter()
        .any(|scope| scope.id == ancestor.record.element_id);
    Ok(ancestor.is_active()
        && ancestor.record.process_instance_key == process_instance.key
        && is_flow_scope)
}

// ============================================================================
// Activation
// ============================================================================

/// Activate the instruction's element. Returns the keys of the flow scope
/// instances it is activated in, outermost first.
fn activate(
    ctx: &mut ProcessingContext<'_>,
    process: &ExecutableProcess,
    process_instance: &ElementInstance,
    instruction: &ActivateInstruction,
) -> Result<Vec<i64>> {
    let element = process.element(&instruction.element_id).ok_or_else(|| {
        ProcessingError::InconsistentState(format!(
            "element '{}' vanished after validation",
            instruction.element_id
        ))
    })?;

    let mut scope_key = process_instance.key;
    let mut scopes = vec![scope_key];
    // Innermost first, ending with the process itself.
    let flow_scopes = process.flow_scopes(&element.id);
    for scope in flow_scopes.iter().rev().skip(1) {
        scope_key = find_or_create_scope(
            ctx,
            scope,
            scope_key,
            instruction.ancestor_scope_key,
            process_instance,
        )?;
        scopes.push(scope_key);
    }

    let key = ctx.next_key()?;
    debug!(key, element_id = %element.id, flow_scope_key = scope_key, "Activating element by modification");
    ctx.append_command(
        key,
        Intent::ActivateElement,
        RecordValue::ProcessInstance(behavior::child_record(
            &process_instance.record,
            element,
            scope_key,
        )),
    );
    Ok(scopes)
}

/// An active instance of `scope` inside `parent_key`: the ancestor if it is
/// one, else the oldest, else a new one.
fn find_or_create_scope(
    ctx: &mut ProcessingContext<'_>,
    scope: &ExecutableElement,
    parent_key: i64,
    ancestor_scope_key: i64,
    process_instance: &ElementInstance,
) -> Result<i64> {
    let candidates: Vec<ElementInstance> = ElementInstanceState::children(ctx.state(), parent_key)?
        .into_iter()
        .filter(|child| child.record.element_id == scope.id && child.is_active())
        .collect();

    if let Some(ancestor) = candidates.iter().find(|c| c.key == ancestor_scope_key) {
        return Ok(ancestor.key);
    }
    if let Some(oldest) = candidates.iter().min_by_key(|c| c.key) {
        return Ok(oldest.key);
    }

    let key = ctx.next_key()?;
    let record = behavior::child_record(&process_instance.record, scope, parent_key);
    ctx.append_event(key, Intent::ElementActivating, RecordValue::ProcessInstance(record.clone()))?;
    ctx.append_event(key, Intent::ElementActivated, RecordValue::ProcessInstance(record))?;
    Ok(key)
}

// ============================================================================
// Termination
// ============================================================================

/// Terminate an element instance, then every flow scope it leaves idle.
/// Scopes an activation of this command goes into are kept.
fn terminate(ctx: &mut ProcessingContext<'_>, key: i64, keep: &BTreeSet<i64>) -> Result<()> {
    // Already gone when an earlier instruction terminated an ancestor.
    let Some(instance) = ElementInstanceState::get(ctx.state(), key)? else {
        return Ok(());
    };
    behavior::terminate_element(ctx, &instance)?;

    let mut scope_key = instance.record.flow_scope_key;
    while scope_key != NO_KEY && !keep.contains(&scope_key) {
        let Some(scope) = ElementInstanceState::get(ctx.state(), scope_key)? else {
            break;
        };
        if !scope.is_idle() {
            break;
        }
        behavior::terminate_element(ctx, &scope)?;
        scope_key = scope.record.flow_scope_key;
    }
    Ok(())
}
