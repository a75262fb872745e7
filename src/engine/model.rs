//! Executable process model.
//!
//! Processes are deployed as a serde description ([`ProcessDefinition`]),
//! either built in code with [`ProcessBuilder`] or read from YAML. At
//! deployment the description is validated and indexed into an
//! [`ExecutableProcess`].
//!
//! A multi-instance activity `X` is represented by two elements sharing the
//! id `X`: a `MULTI_INSTANCE_BODY` in the declared flow scope, and the inner
//! activity whose flow scope is the body.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Invalid process '{bpmn_process_id}': {reason}")]
    Invalid {
        bpmn_process_id: String,
        reason: String,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BpmnElementType {
    Unspecified,
    Process,
    SubProcess,
    StartEvent,
    EndEvent,
    Task,
    ServiceTask,
    IntermediateCatchEvent,
    BoundaryEvent,
    ExclusiveGateway,
    ParallelGateway,
    EventBasedGateway,
    MultiInstanceBody,
    SequenceFlow,
}

impl BpmnElementType {
    pub const ALL: [BpmnElementType; 14] = [
        BpmnElementType::Unspecified,
        BpmnElementType::Process,
        BpmnElementType::SubProcess,
        BpmnElementType::StartEvent,
        BpmnElementType::EndEvent,
        BpmnElementType::Task,
        BpmnElementType::ServiceTask,
        BpmnElementType::IntermediateCatchEvent,
        BpmnElementType::BoundaryEvent,
        BpmnElementType::ExclusiveGateway,
        BpmnElementType::ParallelGateway,
        BpmnElementType::EventBasedGateway,
        BpmnElementType::MultiInstanceBody,
        BpmnElementType::SequenceFlow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BpmnElementType::Unspecified => "UNSPECIFIED",
            BpmnElementType::Process => "PROCESS",
            BpmnElementType::SubProcess => "SUB_PROCESS",
            BpmnElementType::StartEvent => "START_EVENT",
            BpmnElementType::EndEvent => "END_EVENT",
            BpmnElementType::Task => "TASK",
            BpmnElementType::ServiceTask => "SERVICE_TASK",
            BpmnElementType::IntermediateCatchEvent => "INTERMEDIATE_CATCH_EVENT",
            BpmnElementType::BoundaryEvent => "BOUNDARY_EVENT",
            BpmnElementType::ExclusiveGateway => "EXCLUSIVE_GATEWAY",
            BpmnElementType::ParallelGateway => "PARALLEL_GATEWAY",
            BpmnElementType::EventBasedGateway => "EVENT_BASED_GATEWAY",
            BpmnElementType::MultiInstanceBody => "MULTI_INSTANCE_BODY",
            BpmnElementType::SequenceFlow => "SEQUENCE_FLOW",
        }
    }

    /// Elements whose instances contain other element instances.
    pub fn is_flow_scope(&self) -> bool {
        matches!(
            self,
            BpmnElementType::Process
                | BpmnElementType::SubProcess
                | BpmnElementType::MultiInstanceBody
        )
    }

    /// Elements that stay activated until completed by a command.
    pub fn is_wait_state(&self) -> bool {
        matches!(
            self,
            BpmnElementType::ServiceTask
                | BpmnElementType::IntermediateCatchEvent
                | BpmnElementType::EventBasedGateway
        )
    }
}

impl fmt::Display for BpmnElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Definition
// ============================================================================

/// Deployable description of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub bpmn_process_id: String,
    #[serde(default)]
    pub elements: Vec<ElementDefinition>,
    #[serde(default)]
    pub sequence_flows: Vec<SequenceFlowDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDefinition {
    pub id: String,
    pub element_type: BpmnElementType,
    /// Enclosing sub-process; `None` for the process itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<MultiInstanceDefinition>,
    /// Activity a boundary event is attached to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<String>,
    /// Outgoing flow an exclusive gateway takes when no condition holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_flow: Option<String>,
}

/// Parallel multi-instance with a fixed number of inner instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiInstanceDefinition {
    pub cardinality: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlowDefinition {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

/// Holds when the variable visible from the gateway equals `equals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub variable: String,
    pub equals: serde_json::Value,
}

impl ProcessDefinition {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Hex SHA-256 over the canonical JSON form.
    pub fn checksum(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(bytes)))
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Fluent construction of a [`ProcessDefinition`].
///
/// Each element added is connected from the previously added element of the
/// same scope by a generated sequence flow.
pub struct ProcessBuilder {
    definition: ProcessDefinition,
    scope: Option<String>,
    last: Option<String>,
    last_flow: Option<usize>,
}

impl ProcessBuilder {
    pub fn new(bpmn_process_id: impl Into<String>) -> Self {
        Self {
            definition: ProcessDefinition {
                bpmn_process_id: bpmn_process_id.into(),
                elements: Vec::new(),
                sequence_flows: Vec::new(),
            },
            scope: None,
            last: None,
            last_flow: None,
        }
    }

    /// Add an element of any type, connected from the previous one.
    pub fn element(mut self, id: impl Into<String>, element_type: BpmnElementType) -> Self {
        let id = id.into();
        self.definition.elements.push(ElementDefinition {
            id: id.clone(),
            element_type,
            flow_scope: self.scope.clone(),
            multi_instance: None,
            attached_to: None,
            default_flow: None,
        });
        if let Some(source) = self.last.take() {
            self = self.flow(source, id.clone());
        }
        self.last = Some(id);
        self
    }

    pub fn start_event(self, id: impl Into<String>) -> Self {
        self.element(id, BpmnElementType::StartEvent)
    }

    pub fn end_event(self, id: impl Into<String>) -> Self {
        self.element(id, BpmnElementType::EndEvent)
    }

    pub fn task(self, id: impl Into<String>) -> Self {
        self.element(id, BpmnElementType::Task)
    }

    pub fn service_task(self, id: impl Into<String>) -> Self {
        self.element(id, BpmnElementType::ServiceTask)
    }

    pub fn intermediate_catch_event(self, id: impl Into<String>) -> Self {
        self.element(id, BpmnElementType::IntermediateCatchEvent)
    }

    pub fn exclusive_gateway(self, id: impl Into<String>) -> Self {
        self.element(id, BpmnElementType::ExclusiveGateway)
    }

    pub fn parallel_gateway(self, id: impl Into<String>) -> Self {
        self.element(id, BpmnElementType::ParallelGateway)
    }

    pub fn event_based_gateway(self, id: impl Into<String>) -> Self {
        self.element(id, BpmnElementType::EventBasedGateway)
    }

    /// Add a sub-process and build its content with `content`.
    pub fn sub_process(
        self,
        id: impl Into<String>,
        content: impl FnOnce(ProcessBuilder) -> ProcessBuilder,
    ) -> Self {
        let id = id.into();
        let mut outer = self.element(id.clone(), BpmnElementType::SubProcess);

        let inner = ProcessBuilder {
            definition: std::mem::replace(
                &mut outer.definition,
                ProcessDefinition {
                    bpmn_process_id: String::new(),
                    elements: Vec::new(),
                    sequence_flows: Vec::new(),
                },
            ),
            scope: Some(id.clone()),
            last: None,
            last_flow: None,
        };
        outer.definition = content(inner).definition;
        outer.last = Some(id);
        outer.last_flow = None;
        outer
    }

    /// Turn the last added activity into a parallel multi-instance activity.
    pub fn multi_instance(mut self, cardinality: u32) -> Self {
        if let Some(element) = self.last_element_mut() {
            element.multi_instance = Some(MultiInstanceDefinition { cardinality });
        }
        self
    }

    /// Add a boundary event attached to `attached_to`, not connected.
    pub fn boundary_event(mut self, id: impl Into<String>, attached_to: impl Into<String>) -> Self {
        self.definition.elements.push(ElementDefinition {
            id: id.into(),
            element_type: BpmnElementType::BoundaryEvent,
            flow_scope: self.scope.clone(),
            multi_instance: None,
            attached_to: Some(attached_to.into()),
            default_flow: None,
        });
        self
    }

    /// Continue from an already added element, to start another branch.
    pub fn move_to(mut self, id: impl Into<String>) -> Self {
        self.last = Some(id.into());
        self
    }

    /// Connect the last element to an already added `target`.
    pub fn connect_to(mut self, target: impl Into<String>) -> Self {
        let target = target.into();
        if let Some(source) = self.last.take() {
            self = self.flow(source, target.clone());
        }
        self.last = Some(target);
        self
    }

    /// Guard the most recently added sequence flow.
    pub fn condition(mut self, variable: impl Into<String>, equals: serde_json::Value) -> Self {
        if let Some(index) = self.last_flow {
            self.definition.sequence_flows[index].condition = Some(Condition {
                variable: variable.into(),
                equals,
            });
        }
        self
    }

    /// Make the most recently added sequence flow the default of its source.
    pub fn default_flow(mut self) -> Self {
        if let Some(index) = self.last_flow {
            let flow = &self.definition.sequence_flows[index];
            let (flow_id, source) = (flow.id.clone(), flow.source.clone());
            if let Some(element) = self
                .definition
                .elements
                .iter_mut()
                .find(|e| e.id == source)
            {
                element.default_flow = Some(flow_id);
            }
        }
        self
    }

    pub fn build(self) -> ProcessDefinition {
        self.definition
    }

    fn flow(mut self, source: String, target: String) -> Self {
        let id = format!("flow_{}", self.definition.sequence_flows.len() + 1);
        self.definition.sequence_flows.push(SequenceFlowDefinition {
            id,
            source,
            target,
            condition: None,
        });
        self.last_flow = Some(self.definition.sequence_flows.len() - 1);
        self
    }

    fn last_element_mut(&mut self) -> Option<&mut ElementDefinition> {
        let last = self.last.as_deref()?;
        self.definition.elements.iter_mut().find(|e| e.id == last)
    }
}

// ============================================================================
// Executable process
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutableElement {
    pub id: String,
    pub element_type: BpmnElementType,
    /// Id of the enclosing element; `None` only for the process.
    pub flow_scope: Option<String>,
    pub incoming: Vec<String>,
    pub outgoing: Vec<String>,
    pub default_flow: Option<String>,
    /// Set on multi-instance bodies.
    pub cardinality: Option<u32>,
    /// Catch event that is a target of an event-based gateway.
    pub connected_to_event_based_gateway: bool,
}

impl ExecutableElement {
    fn new(id: &str, element_type: BpmnElementType, flow_scope: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            element_type,
            flow_scope,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            default_flow: None,
            cardinality: None,
            connected_to_event_based_gateway: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutableSequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    pub condition: Option<Condition>,
}

/// A validated, indexed process.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutableProcess {
    bpmn_process_id: String,
    elements: BTreeMap<String, ExecutableElement>,
    inner_activities: BTreeMap<String, ExecutableElement>,
    flows: BTreeMap<String, ExecutableSequenceFlow>,
}

impl ExecutableProcess {
    pub fn new(definition: &ProcessDefinition) -> Result<Self> {
        let process_id = definition.bpmn_process_id.as_str();
        let invalid = |reason: String| ModelError::Invalid {
            bpmn_process_id: process_id.to_string(),
            reason,
        };

        if process_id.is_empty() {
            return Err(invalid("bpmn_process_id must not be empty".to_string()));
        }

        let mut ids = BTreeSet::from([process_id.to_string()]);
        for id in definition
            .elements
            .iter()
            .map(|e| &e.id)
            .chain(definition.sequence_flows.iter().map(|f| &f.id))
        {
            if id.is_empty() {
                return Err(invalid("element ids must not be empty".to_string()));
            }
            if !ids.insert(id.clone()) {
                return Err(invalid(format!("duplicate element id '{id}'")));
            }
        }

        let declared: BTreeMap<&str, &ElementDefinition> = definition
            .elements
            .iter()
            .map(|e| (e.id.as_str(), e))
            .collect();

        let mut elements = BTreeMap::new();
        let mut inner_activities = BTreeMap::new();
        elements.insert(
            process_id.to_string(),
            ExecutableElement::new(process_id, BpmnElementType::Process, None),
        );

        for element in &definition.elements {
            match element.element_type {
                BpmnElementType::Process
                | BpmnElementType::MultiInstanceBody
                | BpmnElementType::SequenceFlow => {
                    return Err(invalid(format!(
                        "element '{}' has type '{}' which cannot be declared",
                        element.id, element.element_type
                    )));
                }
                _ => {}
            }

            let scope = match &element.flow_scope {
                None => process_id.to_string(),
                Some(scope) => {
                    let is_sub_process = declared
                        .get(scope.as_str())
                        .is_some_and(|s| s.element_type == BpmnElementType::SubProcess);
                    if !is_sub_process {
                        return Err(invalid(format!(
                            "flow scope '{}' of element '{}' is not a sub-process",
                            scope, element.id
                        )));
                    }
                    scope.clone()
                }
            };

            if element.element_type == BpmnElementType::BoundaryEvent {
                let attached = element.attached_to.as_deref().unwrap_or_default();
                if !declared.contains_key(attached) {
                    return Err(invalid(format!(
                        "boundary event '{}' is attached to unknown element '{}'",
                        element.id, attached
                    )));
                }
            }

            let mut executable =
                ExecutableElement::new(&element.id, element.element_type, Some(scope.clone()));
            executable.default_flow = element.default_flow.clone();

            match element.multi_instance {
                Some(multi_instance) => {
                    if !matches!(
                        element.element_type,
                        BpmnElementType::Task
                            | BpmnElementType::ServiceTask
                            | BpmnElementType::SubProcess
                    ) {
                        return Err(invalid(format!(
                            "element '{}' of type '{}' cannot be multi-instance",
                            element.id, element.element_type
                        )));
                    }
                    let mut body = ExecutableElement::new(
                        &element.id,
                        BpmnElementType::MultiInstanceBody,
                        Some(scope),
                    );
                    body.cardinality = Some(multi_instance.cardinality);
                    executable.flow_scope = Some(element.id.clone());
                    executable.default_flow = None;
                    inner_activities.insert(element.id.clone(), executable);
                    elements.insert(element.id.clone(), body);
                }
                None => {
                    elements.insert(element.id.clone(), executable);
                }
            }
        }

        let mut flows = BTreeMap::new();
        for flow in &definition.sequence_flows {
            let (Some(source), Some(target)) =
                (elements.get(&flow.source), elements.get(&flow.target))
            else {
                return Err(invalid(format!(
                    "sequence flow '{}' connects unknown elements '{}' -> '{}'",
                    flow.id, flow.source, flow.target
                )));
            };
            if source.flow_scope != target.flow_scope {
                return Err(invalid(format!(
                    "sequence flow '{}' crosses a flow scope boundary",
                    flow.id
                )));
            }
            let scope = source.flow_scope.clone();

            if let Some(source) = elements.get_mut(&flow.source) {
                source.outgoing.push(flow.id.clone());
            }
            if let Some(target) = elements.get_mut(&flow.target) {
                target.incoming.push(flow.id.clone());
            }

            let mut as_element =
                ExecutableElement::new(&flow.id, BpmnElementType::SequenceFlow, scope);
            as_element.incoming.push(flow.source.clone());
            as_element.outgoing.push(flow.target.clone());
            elements.insert(flow.id.clone(), as_element);

            flows.insert(
                flow.id.clone(),
                ExecutableSequenceFlow {
                    id: flow.id.clone(),
                    source: flow.source.clone(),
                    target: flow.target.clone(),
                    condition: flow.condition.clone(),
                },
            );
        }

        let mut process = Self {
            bpmn_process_id: process_id.to_string(),
            elements,
            inner_activities,
            flows,
        };
        process.validate_structure()?;
        process.mark_event_based_gateway_targets();
        Ok(process)
    }

    fn validate_structure(&self) -> Result<()> {
        let invalid = |reason: String| ModelError::Invalid {
            bpmn_process_id: self.bpmn_process_id.clone(),
            reason,
        };

        let scopes = std::iter::once(self.bpmn_process_id.as_str()).chain(
            self.elements
                .values()
                .chain(self.inner_activities.values())
                .filter(|e| e.element_type == BpmnElementType::SubProcess)
                .map(|e| e.id.as_str()),
        );
        for scope in scopes {
            let start_events = self
                .elements
                .values()
                .filter(|e| {
                    e.element_type == BpmnElementType::StartEvent
                        && e.flow_scope.as_deref() == Some(scope)
                })
                .count();
            if start_events != 1 {
                return Err(invalid(format!(
                    "scope '{scope}' must contain exactly one start event, found {start_events}"
                )));
            }
        }

        for element in self.elements.values() {
            match element.element_type {
                BpmnElementType::ParallelGateway if element.incoming.len() > 1 => {
                    return Err(invalid(format!(
                        "parallel gateway '{}' joins {} flows; joining is not supported",
                        element.id,
                        element.incoming.len()
                    )));
                }
                BpmnElementType::ExclusiveGateway => {
                    if let Some(default_flow) = &element.default_flow {
                        if !element.outgoing.contains(default_flow) {
                            return Err(invalid(format!(
                                "default flow '{}' is not an outgoing flow of '{}'",
                                default_flow, element.id
                            )));
                        }
                    }
                }
                BpmnElementType::EventBasedGateway => {
                    for flow_id in &element.outgoing {
                        let target = self
                            .flows
                            .get(flow_id)
                            .and_then(|f| self.elements.get(&f.target));
                        if target.map(|t| t.element_type)
                            != Some(BpmnElementType::IntermediateCatchEvent)
                        {
                            return Err(invalid(format!(
                                "event-based gateway '{}' must only lead to intermediate catch events",
                                element.id
                            )));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn mark_event_based_gateway_targets(&mut self) {
        let targets: Vec<String> = self
            .flows
            .values()
            .filter(|flow| {
                self.elements.get(&flow.source).map(|s| s.element_type)
                    == Some(BpmnElementType::EventBasedGateway)
            })
            .map(|flow| flow.target.clone())
            .collect();
        for target in targets {
            if let Some(element) = self.elements.get_mut(&target) {
                element.connected_to_event_based_gateway = true;
            }
        }
    }

    pub fn bpmn_process_id(&self) -> &str {
        &self.bpmn_process_id
    }

    /// The process element itself.
    pub fn root(&self) -> Option<&ExecutableElement> {
        self.elements.get(&self.bpmn_process_id)
    }

    /// Element by id. For multi-instance activities this is the body.
    pub fn element(&self, id: &str) -> Option<&ExecutableElement> {
        self.elements.get(id)
    }

    /// Element an instance of `element_type` with `id` belongs to,
    /// distinguishing a multi-instance body from its inner activity.
    pub fn element_for(&self, id: &str, element_type: BpmnElementType) -> Option<&ExecutableElement> {
        match self.inner_activities.get(id) {
            Some(inner) if element_type != BpmnElementType::MultiInstanceBody => Some(inner),
            _ => self.elements.get(id),
        }
    }

    /// Inner activity of the multi-instance body `id`.
    pub fn inner_activity(&self, id: &str) -> Option<&ExecutableElement> {
        self.inner_activities.get(id)
    }

    pub fn sequence_flow(&self, id: &str) -> Option<&ExecutableSequenceFlow> {
        self.flows.get(id)
    }

    /// Outgoing flows of `element`, in declaration order.
    pub fn outgoing<'a>(
        &'a self,
        element: &'a ExecutableElement,
    ) -> impl Iterator<Item = &'a ExecutableSequenceFlow> + 'a {
        element.outgoing.iter().filter_map(|id| self.flows.get(id))
    }

    /// The start event of the process or sub-process `scope_id`.
    pub fn start_event(&self, scope_id: &str) -> Option<&ExecutableElement> {
        self.elements.values().find(|e| {
            e.element_type == BpmnElementType::StartEvent && e.flow_scope.as_deref() == Some(scope_id)
        })
    }

    /// Enclosing elements of `element_id`, innermost first, ending with the
    /// process.
    pub fn flow_scopes(&self, element_id: &str) -> Vec<&ExecutableElement> {
        let mut scopes = Vec::new();
        let mut current = self
            .elements
            .get(element_id)
            .and_then(|e| e.flow_scope.as_deref());
        while let Some(scope_id) = current {
            let Some(scope) = self.elements.get(scope_id) else {
                break;
            };
            scopes.push(scope);
            current = scope.flow_scope.as_deref();
        }
        scopes
    }

    /// Whether any enclosing element of `element_id` is a multi-instance
    /// body.
    pub fn is_inside_multi_instance_body(&self, element_id: &str) -> bool {
        self.flow_scopes(element_id)
            .iter()
            .any(|scope| scope.element_type == BpmnElementType::MultiInstanceBody)
    }
}
