//! Command processors for deployments and the process instance lifecycle.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use super::behavior::{self, ProcessCache};
use super::model::ExecutableProcess;
use super::state::{ElementInstanceState, ProcessState};
use crate::protocol::{
    DeploymentRecord, Intent, ProcessInstanceCreationRecord, ProcessInstanceRecord, ProcessMetadata,
    ProcessRecord, Record, RecordValue, RejectionType, ValueType, NO_KEY,
};
use crate::stream::{ProcessingContext, ProcessingError, Result, TypedRecordProcessor};

// ============================================================================
// Deployment
// ============================================================================

/// Deploys process definitions. Identical redeployments reuse the existing
/// version.
pub(crate) struct DeploymentCreateProcessor;

impl TypedRecordProcessor for DeploymentCreateProcessor {
    fn process_record(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<()> {
        let RecordValue::Deployment(deployment) = &command.value else {
            return Err(ProcessingError::UnexpectedValue {
                expected: ValueType::Deployment,
                actual: command.value_type(),
            });
        };

        if deployment.resources.is_empty() {
            ctx.reject(
                command,
                RejectionType::InvalidArgument,
                "Expected to deploy at least one resource, but none given",
            );
            return Ok(());
        }

        let mut errors = Vec::new();
        let mut seen = BTreeSet::new();
        for resource in &deployment.resources {
            if !seen.insert(resource.bpmn_process_id.as_str()) {
                errors.push(format!(
                    "'{}': duplicated in deployment",
                    resource.bpmn_process_id
                ));
            } else if let Err(e) = ExecutableProcess::new(resource) {
                errors.push(format!("'{}': {}", resource.bpmn_process_id, e));
            }
        }
        if !errors.is_empty() {
            ctx.reject(
                command,
                RejectionType::InvalidArgument,
                format!(
                    "Expected to deploy new resources, but encountered the following errors:\n{}",
                    errors.join("\n")
                ),
            );
            return Ok(());
        }

        let mut processes = Vec::with_capacity(deployment.resources.len());
        for resource in &deployment.resources {
            let checksum = resource
                .checksum()
                .map_err(|e| ProcessingError::Failed(e.to_string()))?;
            let latest = ProcessState::latest(ctx.state(), &resource.bpmn_process_id)?;

            if let Some(latest) = latest.as_ref().filter(|p| p.checksum == checksum) {
                debug!(bpmn_process_id = %latest.bpmn_process_id, version = latest.version, "Duplicate deployment");
                processes.push(ProcessMetadata {
                    key: latest.key,
                    bpmn_process_id: latest.bpmn_process_id.clone(),
                    version: latest.version,
                    checksum,
                    duplicate: true,
                });
                continue;
            }

            let key = ctx.next_key()?;
            let version = latest.map_or(1, |p| p.version + 1);
            ctx.append_event(
                key,
                Intent::Created,
                RecordValue::Process(ProcessRecord {
                    key,
                    bpmn_process_id: resource.bpmn_process_id.clone(),
                    version,
                    checksum: checksum.clone(),
                    definition: resource.clone(),
                }),
            )?;
            info!(bpmn_process_id = %resource.bpmn_process_id, version, key, "Process deployed");
            processes.push(ProcessMetadata {
                key,
                bpmn_process_id: resource.bpmn_process_id.clone(),
                version,
                checksum,
                duplicate: false,
            });
        }

        let key = ctx.next_key()?;
        let created = RecordValue::Deployment(DeploymentRecord {
            resources: deployment.resources.clone(),
            processes,
        });
        ctx.append_event(key, Intent::Created, created.clone())?;
        ctx.respond(key, Intent::Created, created);
        Ok(())
    }
}

// ============================================================================
// Process instance creation
// ============================================================================

pub(crate) struct CreateProcessInstanceProcessor {
    processes: Arc<ProcessCache>,
}

impl CreateProcessInstanceProcessor {
    pub(crate) fn new(processes: Arc<ProcessCache>) -> Self {
        Self { processes }
    }

    fn find_process(
        ctx: &ProcessingContext<'_>,
        creation: &ProcessInstanceCreationRecord,
    ) -> Result<Option<ProcessRecord>> {
        let tx = ctx.state();
        Ok(if creation.process_definition_key != NO_KEY {
            ProcessState::by_key(tx, creation.process_definition_key)?
        } else if creation.version < 0 {
            ProcessState::latest(tx, &creation.bpmn_process_id)?
        } else {
            ProcessState::by_id_and_version(tx, &creation.bpmn_process_id, creation.version)?
        })
    }
}

impl TypedRecordProcessor for CreateProcessInstanceProcessor {
    fn process_record(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<()> {
        let RecordValue::ProcessInstanceCreation(creation) = &command.value else {
            return Err(ProcessingError::UnexpectedValue {
                expected: ValueType::ProcessInstanceCreation,
                actual: command.value_type(),
            });
        };

        let Some(deployed) = Self::find_process(ctx, creation)? else {
            let reason = if creation.process_definition_key != NO_KEY {
                format!(
                    "Expected to find process definition with key '{}', but none found",
                    creation.process_definition_key
                )
            } else {
                format!(
                    "Expected to find process definition with process ID '{}', but none found",
                    creation.bpmn_process_id
                )
            };
            ctx.reject(command, RejectionType::NotFound, reason);
            return Ok(());
        };
        let process = self.processes.require(ctx.state(), deployed.key)?;
        let root = process.root().ok_or_else(|| {
            ProcessingError::InconsistentState(format!("process {} has no root element", deployed.key))
        })?;

        let process_instance_key = ctx.next_key()?;
        let record = ProcessInstanceRecord {
            bpmn_process_id: deployed.bpmn_process_id.clone(),
            version: deployed.version,
            process_definition_key: deployed.key,
            process_instance_key,
            element_id: root.id.clone(),
            bpmn_element_type: root.element_type,
            flow_scope_key: NO_KEY,
            via_sequence_flow: false,
        };

        behavior::set_variables(ctx, process_instance_key, &record, &creation.variables)?;
        ctx.append_command(
            process_instance_key,
            Intent::ActivateElement,
            RecordValue::ProcessInstance(record),
        );

        let created = RecordValue::ProcessInstanceCreation(ProcessInstanceCreationRecord {
            bpmn_process_id: deployed.bpmn_process_id,
            version: deployed.version,
            process_definition_key: deployed.key,
            variables: creation.variables.clone(),
            process_instance_key,
        });
        ctx.append_event(process_instance_key, Intent::Created, created.clone())?;
        ctx.respond(process_instance_key, Intent::Created, created);
        Ok(())
    }
}

// ============================================================================
// Element lifecycle
// ============================================================================

/// Activates an element instance written by the engine itself.
pub(crate) struct ActivateElementProcessor {
    processes: Arc<ProcessCache>,
}

impl ActivateElementProcessor {
    pub(crate) fn new(processes: Arc<ProcessCache>) -> Self {
        Self { processes }
    }
}

impl TypedRecordProcessor for ActivateElementProcessor {
    fn process_record(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<()> {
        let record = behavior::instance_value(command)?;

        if ElementInstanceState::get(ctx.state(), command.key)?.is_some() {
            ctx.reject(
                command,
                RejectionType::InvalidState,
                format!(
                    "Expected to activate element instance with key '{}', but it already exists",
                    command.key
                ),
            );
            return Ok(());
        }
        if record.flow_scope_key != NO_KEY {
            let scope_active = ElementInstanceState::get(ctx.state(), record.flow_scope_key)?
                .is_some_and(|scope| scope.is_active());
            if !scope_active {
                debug!(key = command.key, flow_scope_key = record.flow_scope_key, "Flow scope gone, not activating");
                ctx.reject(
                    command,
                    RejectionType::InvalidState,
                    format!(
                        "Expected flow scope instance with key '{}' to be active, but it is not",
                        record.flow_scope_key
                    ),
                );
                return Ok(());
            }
        }

        let process = self.processes.require(ctx.state(), record.process_definition_key)?;
        behavior::activate_element(ctx, &process, command.key, record)
    }
}

/// Completes a waiting element instance.
pub(crate) struct CompleteElementProcessor {
    processes: Arc<ProcessCache>,
}

impl CompleteElementProcessor {
    pub(crate) fn new(processes: Arc<ProcessCache>) -> Self {
        Self { processes }
    }
}

impl TypedRecordProcessor for CompleteElementProcessor {
    fn process_record(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<()> {
        let Some(instance) = ElementInstanceState::get(ctx.state(), command.key)? else {
            ctx.reject(
                command,
                RejectionType::NotFound,
                format!(
                    "Expected to complete element instance with key '{}', but no such element instance was found",
                    command.key
                ),
            );
            return Ok(());
        };
        if !instance.is_active() || !instance.record.bpmn_element_type.is_wait_state() {
            ctx.reject(
                command,
                RejectionType::InvalidState,
                format!(
                    "Expected to complete element instance with key '{}', but it is a '{}' in state {:?}",
                    command.key, instance.record.bpmn_element_type, instance.lifecycle
                ),
            );
            return Ok(());
        }

        let process = self
            .processes
            .require(ctx.state(), instance.record.process_definition_key)?;
        behavior::complete_element(ctx, &process, instance.key, &instance.record)?;
        ctx.respond(
            instance.key,
            Intent::ElementCompleted,
            RecordValue::ProcessInstance(instance.record),
        );
        Ok(())
    }
}

/// Terminates one element instance and everything inside it.
pub(crate) struct TerminateElementProcessor;

impl TypedRecordProcessor for TerminateElementProcessor {
    fn process_record(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<()> {
        let Some(instance) = ElementInstanceState::get(ctx.state(), command.key)? else {
            ctx.reject(
                command,
                RejectionType::NotFound,
                format!(
                    "Expected to terminate element instance with key '{}', but no such element instance was found",
                    command.key
                ),
            );
            return Ok(());
        };
        behavior::terminate_element(ctx, &instance)?;
        ctx.respond(
            instance.key,
            Intent::ElementTerminated,
            RecordValue::ProcessInstance(instance.record),
        );
        Ok(())
    }
}

/// Cancels a whole process instance.
pub(crate) struct CancelProcessInstanceProcessor;

impl TypedRecordProcessor for CancelProcessInstanceProcessor {
    fn process_record(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<()> {
        let instance = ElementInstanceState::get(ctx.state(), command.key)?
            .filter(|instance| instance.record.flow_scope_key == NO_KEY);
        let Some(instance) = instance else {
            ctx.reject(
                command,
                RejectionType::NotFound,
                format!(
                    "Expected to cancel a process instance with key '{}', but no such process was found",
                    command.key
                ),
            );
            return Ok(());
        };

        info!(process_instance_key = instance.key, "Cancelling process instance");
        behavior::terminate_element(ctx, &instance)?;
        ctx.respond(
            instance.key,
            Intent::ElementTerminated,
            RecordValue::ProcessInstance(instance.record),
        );
        Ok(())
    }
}
