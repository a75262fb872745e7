//! Record values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ValueType, NO_KEY};
use crate::engine::model::{BpmnElementType, ProcessDefinition};

fn no_key() -> i64 {
    NO_KEY
}

fn latest_version() -> i32 {
    -1
}

/// Typed payload of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordValue {
    Deployment(DeploymentRecord),
    Process(ProcessRecord),
    ProcessInstance(ProcessInstanceRecord),
    ProcessInstanceCreation(ProcessInstanceCreationRecord),
    ProcessInstanceModification(ProcessInstanceModificationRecord),
    Variable(VariableRecord),
}

impl RecordValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            RecordValue::Deployment(_) => ValueType::Deployment,
            RecordValue::Process(_) => ValueType::Process,
            RecordValue::ProcessInstance(_) => ValueType::ProcessInstance,
            RecordValue::ProcessInstanceCreation(_) => ValueType::ProcessInstanceCreation,
            RecordValue::ProcessInstanceModification(_) => ValueType::ProcessInstanceModification,
            RecordValue::Variable(_) => ValueType::Variable,
        }
    }
}

// ============================================================================
// Deployment
// ============================================================================

/// Deployment command and event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Process definitions to deploy.
    pub resources: Vec<ProcessDefinition>,
    /// Filled in by the deployment event.
    #[serde(default)]
    pub processes: Vec<ProcessMetadata>,
}

/// Identity of one deployed process version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMetadata {
    pub key: i64,
    pub bpmn_process_id: String,
    pub version: i32,
    /// Hex SHA-256 of the definition.
    pub checksum: String,
    /// True if an identical definition was already deployed.
    #[serde(default)]
    pub duplicate: bool,
}

/// A deployed process version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub key: i64,
    pub bpmn_process_id: String,
    pub version: i32,
    pub checksum: String,
    pub definition: ProcessDefinition,
}

// ============================================================================
// Process instance
// ============================================================================

/// Element instance lifecycle records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstanceRecord {
    pub bpmn_process_id: String,
    pub version: i32,
    pub process_definition_key: i64,
    pub process_instance_key: i64,
    pub element_id: String,
    pub bpmn_element_type: BpmnElementType,
    /// Key of the enclosing element instance, `NO_KEY` for the process.
    pub flow_scope_key: i64,
    /// The activation consumes a sequence flow taken into the flow scope.
    #[serde(default)]
    pub via_sequence_flow: bool,
}

/// Create a new process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstanceCreationRecord {
    pub bpmn_process_id: String,
    /// `-1` selects the latest version.
    #[serde(default = "latest_version")]
    pub version: i32,
    #[serde(default = "no_key")]
    pub process_definition_key: i64,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Filled in by the creation event.
    #[serde(default = "no_key")]
    pub process_instance_key: i64,
}

impl ProcessInstanceCreationRecord {
    /// Latest version of `bpmn_process_id`, no variables.
    pub fn latest(bpmn_process_id: impl Into<String>) -> Self {
        Self {
            bpmn_process_id: bpmn_process_id.into(),
            version: latest_version(),
            process_definition_key: NO_KEY,
            variables: BTreeMap::new(),
            process_instance_key: NO_KEY,
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

// ============================================================================
// Modification
// ============================================================================

/// Ad-hoc activation and termination of elements in a running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstanceModificationRecord {
    pub process_instance_key: i64,
    #[serde(default)]
    pub activate_instructions: Vec<ActivateInstruction>,
    #[serde(default)]
    pub terminate_instructions: Vec<TerminateInstruction>,
}

impl ProcessInstanceModificationRecord {
    pub fn new(process_instance_key: i64) -> Self {
        Self {
            process_instance_key,
            activate_instructions: Vec::new(),
            terminate_instructions: Vec::new(),
        }
    }

    pub fn activate(mut self, element_id: impl Into<String>) -> Self {
        self.activate_instructions.push(ActivateInstruction {
            element_id: element_id.into(),
            ancestor_scope_key: NO_KEY,
            variable_instructions: Vec::new(),
        });
        self
    }

    pub fn activate_with(mut self, instruction: ActivateInstruction) -> Self {
        self.activate_instructions.push(instruction);
        self
    }

    pub fn terminate(mut self, element_instance_key: i64) -> Self {
        self.terminate_instructions.push(TerminateInstruction {
            element_instance_key,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateInstruction {
    pub element_id: String,
    /// Preferred flow-scope instance; `NO_KEY` lets the engine choose.
    #[serde(default = "no_key")]
    pub ancestor_scope_key: i64,
    #[serde(default)]
    pub variable_instructions: Vec<VariableInstruction>,
}

/// Variables to set when activating. An empty `element_id` targets the
/// process instance scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInstruction {
    #[serde(default)]
    pub element_id: String,
    pub variables: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateInstruction {
    pub element_instance_key: i64,
}

// ============================================================================
// Variables
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub name: String,
    pub value: serde_json::Value,
    pub scope_key: i64,
    pub process_instance_key: i64,
    pub process_definition_key: i64,
    pub bpmn_process_id: String,
}
