use serde_json::json;

use super::model::{BpmnElementType, ProcessBuilder, ProcessDefinition};
use super::state::{ElementInstance, ElementInstanceState, ElementLifecycle};
use super::*;
use crate::protocol::{
    ActivateInstruction, DeploymentRecord, ProcessInstanceCreationRecord,
    ProcessInstanceModificationRecord, ProcessInstanceRecord, Record, RecordValue, RejectionType,
    VariableInstruction, NO_KEY,
};
use crate::state::Db;
use crate::stream::CommandResponse;
use crate::test_utils::{one_task_process, sub_process_process, EngineHarness};

const PROCESS: &str = "process";

fn rejection(response: &CommandResponse) -> (Option<RejectionType>, &str) {
    (
        response.record.metadata.rejection_type,
        response.record.metadata.rejection_reason.as_str(),
    )
}

async fn modify(
    harness: &mut EngineHarness,
    modification: ProcessInstanceModificationRecord,
) -> CommandResponse {
    harness
        .execute(
            NO_KEY,
            Intent::Modify,
            RecordValue::ProcessInstanceModification(modification),
        )
        .await
}

/// Latest process instance value written for `key`.
fn instance_value(harness: &mut EngineHarness, key: i64) -> RecordValue {
    harness
        .log()
        .iter()
        .rev()
        .find(|r| r.key == key && r.value_type() == ValueType::ProcessInstance)
        .map(|r| r.value.clone())
        .unwrap()
}

async fn complete(harness: &mut EngineHarness, key: i64) -> CommandResponse {
    let value = instance_value(harness, key);
    harness.execute(key, Intent::CompleteElement, value).await
}

// ============================================================================
// Deployment
// ============================================================================

#[tokio::test]
async fn test_deploy_assigns_versions_and_detects_duplicates() {
    let mut harness = EngineHarness::start();
    let deploy = |definition| {
        RecordValue::Deployment(DeploymentRecord {
            resources: vec![definition],
            processes: Vec::new(),
        })
    };

    let first = harness
        .execute(NO_KEY, Intent::Create, deploy(one_task_process(PROCESS)))
        .await;
    let again = harness
        .execute(NO_KEY, Intent::Create, deploy(one_task_process(PROCESS)))
        .await;
    let changed = ProcessBuilder::new(PROCESS)
        .start_event("start")
        .end_event("end")
        .build();
    let second = harness
        .execute(NO_KEY, Intent::Create, deploy(changed))
        .await;

    let metadata = |response: &CommandResponse| match &response.record.value {
        RecordValue::Deployment(d) => d.processes[0].clone(),
        other => panic!("unexpected value {other:?}"),
    };
    let (first, again, second) = (metadata(&first), metadata(&again), metadata(&second));

    assert_eq!(first.version, 1);
    assert!(!first.duplicate);
    assert!(again.duplicate);
    assert_eq!(again.key, first.key);
    assert_eq!(second.version, 2);
    assert_ne!(second.key, first.key);

    harness.close().await;
}

#[tokio::test]
async fn test_deploy_rejects_invalid_process() {
    let mut harness = EngineHarness::start();
    let invalid = ProcessBuilder::new(PROCESS).task("no_start").build();

    let response = harness
        .execute(
            NO_KEY,
            Intent::Create,
            RecordValue::Deployment(DeploymentRecord {
                resources: vec![invalid],
                processes: Vec::new(),
            }),
        )
        .await;

    let (rejection_type, reason) = rejection(&response);
    assert_eq!(rejection_type, Some(RejectionType::InvalidArgument));
    assert!(reason.starts_with("Expected to deploy new resources"));
    assert!(reason.contains("'process'"));
    harness.close().await;
}

#[tokio::test]
async fn test_deploy_rejects_empty_deployment() {
    let mut harness = EngineHarness::start();

    let response = harness
        .execute(
            NO_KEY,
            Intent::Create,
            RecordValue::Deployment(DeploymentRecord::default()),
        )
        .await;

    assert_eq!(
        rejection(&response),
        (
            Some(RejectionType::InvalidArgument),
            "Expected to deploy at least one resource, but none given"
        )
    );
    harness.close().await;
}

// ============================================================================
// Process instance lifecycle
// ============================================================================

#[tokio::test]
async fn test_instance_waits_at_service_task_and_completes() {
    let mut harness = EngineHarness::start();
    harness.deploy(one_task_process(PROCESS)).await;
    let instance = harness.create_instance(PROCESS).await;

    assert_eq!(harness.active_elements(), vec![PROCESS, "task"]);

    let task = harness.element_key("task");
    let response = complete(&mut harness, task).await;
    assert_eq!(response.record.intent(), Intent::ElementCompleted);

    assert!(harness.active_elements().is_empty());
    let completed = harness.element_events(PROCESS, Intent::ElementCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].key, instance);
    assert_eq!(harness.element_events("end", Intent::ElementCompleted).len(), 1);

    let mut db = harness.close().await;
    assert!(ElementInstanceState::get(&db.transaction(), instance)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_create_unknown_process_rejected() {
    let mut harness = EngineHarness::start();

    let response = harness
        .execute(
            NO_KEY,
            Intent::Create,
            RecordValue::ProcessInstanceCreation(ProcessInstanceCreationRecord::latest("nope")),
        )
        .await;

    assert_eq!(
        rejection(&response),
        (
            Some(RejectionType::NotFound),
            "Expected to find process definition with process ID 'nope', but none found"
        )
    );
    harness.close().await;
}

#[tokio::test]
async fn test_exclusive_gateway_follows_variables() {
    let mut harness = EngineHarness::start();
    harness
        .deploy(
            ProcessBuilder::new(PROCESS)
                .start_event("start")
                .exclusive_gateway("gw")
                .service_task("approved")
                .condition("approved", json!(true))
                .end_event("end_approved")
                .move_to("gw")
                .service_task("declined")
                .default_flow()
                .end_event("end_declined")
                .build(),
        )
        .await;

    harness
        .execute(
            NO_KEY,
            Intent::Create,
            RecordValue::ProcessInstanceCreation(
                ProcessInstanceCreationRecord::latest(PROCESS).with_variable("approved", json!(true)),
            ),
        )
        .await;
    assert_eq!(harness.active_elements(), vec![PROCESS, "approved"]);

    harness.create_instance(PROCESS).await;
    assert_eq!(
        harness.active_elements(),
        vec![PROCESS, "approved", PROCESS, "declined"]
    );
    harness.close().await;
}

#[tokio::test]
async fn test_sub_process_runs_to_completion() {
    let mut harness = EngineHarness::start();
    harness.deploy(sub_process_process(PROCESS)).await;
    harness.create_instance(PROCESS).await;

    let a = harness.element_key("A");
    complete(&mut harness, a).await;
    assert_eq!(harness.active_elements(), vec![PROCESS, "sub", "B"]);

    let b = harness.element_key("B");
    complete(&mut harness, b).await;
    assert!(harness.active_elements().is_empty());
    assert_eq!(harness.element_events("sub", Intent::ElementCompleted).len(), 1);
    assert_eq!(harness.element_events(PROCESS, Intent::ElementCompleted).len(), 1);
    harness.close().await;
}

fn multi_instance_process(inner: fn(ProcessBuilder, &str) -> ProcessBuilder, cardinality: u32) -> ProcessDefinition {
    inner(ProcessBuilder::new(PROCESS).start_event("start"), "work")
        .multi_instance(cardinality)
        .end_event("end")
        .build()
}

/// Events of `element_id` with `intent`, split into (body, inner instances).
fn multi_instance_events(
    harness: &mut EngineHarness,
    element_id: &str,
    intent: Intent,
) -> (Vec<Record>, Vec<Record>) {
    harness
        .element_events(element_id, intent)
        .into_iter()
        .partition(|r| {
            matches!(&r.value, RecordValue::ProcessInstance(v) if v.bpmn_element_type == BpmnElementType::MultiInstanceBody)
        })
}

fn rejections(harness: &mut EngineHarness) -> Vec<String> {
    harness
        .log()
        .iter()
        .filter(|r| r.metadata.rejection_type.is_some())
        .map(|r| r.metadata.rejection_reason.clone())
        .collect()
}

#[tokio::test]
async fn test_multi_instance_completes_after_all_inner_instances() {
    let mut harness = EngineHarness::start();
    harness
        .deploy(multi_instance_process(|b, id| b.service_task(id), 3))
        .await;
    harness.create_instance(PROCESS).await;

    let (_, inner) = multi_instance_events(&mut harness, "work", Intent::ElementActivated);
    let inner: Vec<i64> = inner.iter().map(|r| r.key).collect();
    assert_eq!(inner.len(), 3);

    for key in &inner[..2] {
        complete(&mut harness, *key).await;
    }
    assert!(harness.element_events("end", Intent::ElementActivated).is_empty());

    complete(&mut harness, inner[2]).await;
    let (body, _) = multi_instance_events(&mut harness, "work", Intent::ElementCompleted);
    assert_eq!(body.len(), 1);
    assert_eq!(harness.element_events("end", Intent::ElementCompleted).len(), 1);
    assert!(harness.active_elements().is_empty());
    harness.close().await;
}

#[tokio::test]
async fn test_multi_instance_runs_every_pass_through_inner_instance() {
    let mut harness = EngineHarness::start();
    harness.deploy(multi_instance_process(|b, id| b.task(id), 3)).await;
    harness.create_instance(PROCESS).await;

    assert_eq!(rejections(&mut harness), Vec::<String>::new());
    let (body, inner) = multi_instance_events(&mut harness, "work", Intent::ElementCompleted);
    assert_eq!(inner.len(), 3);
    assert_eq!(body.len(), 1);
    // the body completes only after its last inner instance
    assert!(inner.iter().all(|r| r.position < body[0].position));
    assert_eq!(harness.element_events("end", Intent::ElementCompleted).len(), 1);
    assert_eq!(harness.element_events(PROCESS, Intent::ElementCompleted).len(), 1);
    assert!(harness.active_elements().is_empty());
    harness.close().await;
}

#[tokio::test]
async fn test_multi_instance_with_single_or_no_inner_instance() {
    for cardinality in [0, 1] {
        let mut harness = EngineHarness::start();
        harness
            .deploy(multi_instance_process(|b, id| b.task(id), cardinality))
            .await;
        harness.create_instance(PROCESS).await;

        assert_eq!(rejections(&mut harness), Vec::<String>::new());
        let (body, inner) = multi_instance_events(&mut harness, "work", Intent::ElementCompleted);
        assert_eq!(inner.len(), cardinality as usize);
        assert_eq!(body.len(), 1, "cardinality {cardinality}");
        assert_eq!(harness.element_events(PROCESS, Intent::ElementCompleted).len(), 1);
        assert!(harness.active_elements().is_empty());
        harness.close().await;
    }
}

#[tokio::test]
async fn test_cancel_terminates_instance_depth_first() {
    let mut harness = EngineHarness::start();
    harness.deploy(sub_process_process(PROCESS)).await;
    let instance = harness.create_instance(PROCESS).await;
    let a = harness.element_key("A");
    complete(&mut harness, a).await;

    let value = instance_value(&mut harness, instance);
    let response = harness.execute(instance, Intent::Cancel, value).await;
    assert_eq!(response.record.intent(), Intent::ElementTerminated);

    let terminated: Vec<String> = harness
        .log()
        .iter()
        .filter(|r| r.is_event() && r.intent() == Intent::ElementTerminated)
        .filter_map(|r| match &r.value {
            RecordValue::ProcessInstance(v) => Some(v.element_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(terminated, vec!["B", "sub", PROCESS]);
    assert!(harness.active_elements().is_empty());
    harness.close().await;
}

#[tokio::test]
async fn test_complete_unknown_element_rejected() {
    let mut harness = EngineHarness::start();
    harness.deploy(one_task_process(PROCESS)).await;
    harness.create_instance(PROCESS).await;
    let task = harness.element_key("task");
    let value = instance_value(&mut harness, task);

    let response = harness.execute(424242, Intent::CompleteElement, value).await;

    assert_eq!(
        rejection(&response),
        (
            Some(RejectionType::NotFound),
            "Expected to complete element instance with key '424242', but no such element instance was found"
        )
    );
    harness.close().await;
}

// ============================================================================
// Modification
// ============================================================================

#[tokio::test]
async fn test_modify_unknown_instance_rejected() {
    let mut harness = EngineHarness::start();

    let response = modify(&mut harness, ProcessInstanceModificationRecord::new(12345)).await;

    assert_eq!(
        rejection(&response),
        (
            Some(RejectionType::NotFound),
            "Expected to modify process instance but no process instance found with key '12345'"
        )
    );
    harness.close().await;
}

#[tokio::test]
async fn test_modify_rejects_unknown_elements() {
    let mut harness = EngineHarness::start();
    harness.deploy(one_task_process(PROCESS)).await;
    let instance = harness.create_instance(PROCESS).await;

    let response = modify(
        &mut harness,
        ProcessInstanceModificationRecord::new(instance)
            .activate("missing")
            .activate("task")
            .activate("also_missing")
            .activate("missing"),
    )
    .await;

    assert_eq!(
        rejection(&response),
        (
            Some(RejectionType::InvalidArgument),
            "Expected to modify instance of process 'process' but it contains one or more activate instructions with an element that could not be found: 'missing', 'also_missing'"
        )
    );
    harness.close().await;
}

#[tokio::test]
async fn test_modify_rejects_unsupported_element_types() {
    let mut harness = EngineHarness::start();
    harness.deploy(one_task_process(PROCESS)).await;
    let instance = harness.create_instance(PROCESS).await;

    let response = modify(
        &mut harness,
        ProcessInstanceModificationRecord::new(instance)
            .activate("start")
            .activate("flow_1"),
    )
    .await;

    assert_eq!(
        rejection(&response),
        (
            Some(RejectionType::InvalidArgument),
            "Expected to modify instance of process 'process' but it contains one or more activate instructions for elements that are unsupported: 'start', 'flow_1'. The activation of elements with type 'START_EVENT', 'SEQUENCE_FLOW' is not supported. Supported element types are: [PROCESS, SUB_PROCESS, END_EVENT, TASK, SERVICE_TASK, INTERMEDIATE_CATCH_EVENT, EXCLUSIVE_GATEWAY, PARALLEL_GATEWAY, EVENT_BASED_GATEWAY, MULTI_INSTANCE_BODY]."
        )
    );
    harness.close().await;
}

#[tokio::test]
async fn test_modify_rejects_event_based_gateway_targets() {
    let mut harness = EngineHarness::start();
    harness
        .deploy(
            ProcessBuilder::new(PROCESS)
                .start_event("start")
                .event_based_gateway("gw")
                .intermediate_catch_event("timer")
                .end_event("end_timer")
                .move_to("gw")
                .intermediate_catch_event("message")
                .end_event("end_message")
                .build(),
        )
        .await;
    let instance = harness.create_instance(PROCESS).await;

    let response = modify(
        &mut harness,
        ProcessInstanceModificationRecord::new(instance).activate("timer"),
    )
    .await;

    assert_eq!(
        rejection(&response),
        (
            Some(RejectionType::InvalidArgument),
            "Expected to modify instance of process 'process' but it contains one or more activate instructions for elements that are unsupported: 'timer'. The activation of events belonging to an event-based gateway is not supported."
        )
    );
    harness.close().await;
}

#[tokio::test]
async fn test_modify_rejects_elements_inside_multi_instance() {
    let mut harness = EngineHarness::start();
    harness
        .deploy(
            ProcessBuilder::new(PROCESS)
                .start_event("start")
                .sub_process("mi", |sub| sub.start_event("mi_start").service_task("inner"))
                .multi_instance(2)
                .end_event("end")
                .build(),
        )
        .await;
    let instance = harness.create_instance(PROCESS).await;
    assert_eq!(harness.element_events("inner", Intent::ElementActivated).len(), 2);

    let response = modify(
        &mut harness,
        ProcessInstanceModificationRecord::new(instance).activate("inner"),
    )
    .await;

    assert_eq!(
        rejection(&response),
        (
            Some(RejectionType::InvalidArgument),
            "Expected to modify instance of process 'process' but it contains one or more activate instructions for elements that are unsupported: 'inner'. The activation of elements inside a multi-instance subprocess is not supported."
        )
    );
    harness.close().await;
}

#[tokio::test]
async fn test_modify_rejects_unknown_terminate_keys() {
    let mut harness = EngineHarness::start();
    harness.deploy(one_task_process(PROCESS)).await;
    let instance = harness.create_instance(PROCESS).await;

    let response = modify(
        &mut harness,
        ProcessInstanceModificationRecord::new(instance).terminate(999),
    )
    .await;

    let (rejection_type, reason) = rejection(&response);
    assert_eq!(rejection_type, Some(RejectionType::NotFound));
    assert!(reason.ends_with("terminate instructions with an element instance that could not be found: '999'"));
    assert_eq!(harness.active_elements(), vec![PROCESS, "task"]);
    harness.close().await;
}

#[tokio::test]
async fn test_modify_activates_element_inside_new_flow_scope() {
    let mut harness = EngineHarness::start();
    harness.deploy(sub_process_process(PROCESS)).await;
    let instance = harness.create_instance(PROCESS).await;

    let response = modify(
        &mut harness,
        ProcessInstanceModificationRecord::new(instance).activate("B"),
    )
    .await;

    assert_eq!(response.record.intent(), Intent::Modified);
    assert_eq!(response.record.key, instance);
    assert_eq!(harness.active_elements(), vec![PROCESS, "A", "sub", "B"]);
    assert!(harness
        .element_events("start_sub", Intent::ElementActivated)
        .is_empty());

    let sub = harness.element_key("sub");
    let b = harness.element_events("B", Intent::ElementActivated);
    assert!(matches!(&b[0].value, RecordValue::ProcessInstance(v) if v.flow_scope_key == sub));
    harness.close().await;
}

#[tokio::test]
async fn test_modify_reuses_existing_flow_scope() {
    let mut harness = EngineHarness::start();
    harness.deploy(sub_process_process(PROCESS)).await;
    let instance = harness.create_instance(PROCESS).await;
    let a = harness.element_key("A");
    complete(&mut harness, a).await;
    let sub = harness.element_key("sub");

    modify(
        &mut harness,
        ProcessInstanceModificationRecord::new(instance).activate_with(ActivateInstruction {
            element_id: "B".to_string(),
            ancestor_scope_key: sub,
            variable_instructions: Vec::new(),
        }),
    )
    .await;

    assert_eq!(harness.element_events("sub", Intent::ElementActivated).len(), 1);
    assert_eq!(harness.active_elements(), vec![PROCESS, "sub", "B", "B"]);
    harness.close().await;
}

#[tokio::test]
async fn test_modify_rejects_foreign_ancestor() {
    let mut harness = EngineHarness::start();
    harness.deploy(sub_process_process(PROCESS)).await;
    let instance = harness.create_instance(PROCESS).await;
    let a = harness.element_key("A");

    let response = modify(
        &mut harness,
        ProcessInstanceModificationRecord::new(instance).activate_with(ActivateInstruction {
            element_id: "B".to_string(),
            ancestor_scope_key: a,
            variable_instructions: Vec::new(),
        }),
    )
    .await;

    let (rejection_type, reason) = rejection(&response);
    assert_eq!(rejection_type, Some(RejectionType::InvalidArgument));
    assert!(reason.ends_with(&format!("is not in an active state: '{a}'")));
    harness.close().await;
}

#[tokio::test]
async fn test_terminating_last_element_terminates_instance() {
    let mut harness = EngineHarness::start();
    harness.deploy(sub_process_process(PROCESS)).await;
    let instance = harness.create_instance(PROCESS).await;
    let a = harness.element_key("A");
    complete(&mut harness, a).await;
    let b = harness.element_key("B");

    modify(&mut harness, ProcessInstanceModificationRecord::new(instance).terminate(b)).await;

    assert!(harness.active_elements().is_empty());
    assert_eq!(harness.element_events("sub", Intent::ElementTerminated).len(), 1);
    let terminated = harness.element_events(PROCESS, Intent::ElementTerminated);
    assert_eq!(terminated.len(), 1);
    assert_eq!(terminated[0].key, instance);
    harness.close().await;
}

#[tokio::test]
async fn test_terminate_keeps_scope_with_other_children() {
    let mut harness = EngineHarness::start();
    harness.deploy(sub_process_process(PROCESS)).await;
    let instance = harness.create_instance(PROCESS).await;
    modify(
        &mut harness,
        ProcessInstanceModificationRecord::new(instance).activate("B"),
    )
    .await;
    let a = harness.element_key("A");

    modify(&mut harness, ProcessInstanceModificationRecord::new(instance).terminate(a)).await;

    assert_eq!(harness.active_elements(), vec![PROCESS, "sub", "B"]);
    harness.close().await;
}

#[tokio::test]
async fn test_activate_and_terminate_in_one_modification() {
    let mut harness = EngineHarness::start();
    harness.deploy(one_task_process(PROCESS)).await;
    let instance = harness.create_instance(PROCESS).await;
    let task = harness.element_key("task");

    let response = modify(
        &mut harness,
        ProcessInstanceModificationRecord::new(instance)
            .activate("task")
            .terminate(task),
    )
    .await;

    assert_eq!(response.record.intent(), Intent::Modified);
    assert_eq!(harness.active_elements(), vec![PROCESS, "task"]);
    assert_ne!(harness.element_key("task"), task);
    assert!(harness
        .element_events(PROCESS, Intent::ElementTerminated)
        .is_empty());
    harness.close().await;
}

#[tokio::test]
async fn test_modify_sets_global_variables() {
    let mut harness = EngineHarness::start();
    harness.deploy(one_task_process(PROCESS)).await;
    let instance = harness.create_instance(PROCESS).await;

    modify(
        &mut harness,
        ProcessInstanceModificationRecord::new(instance).activate_with(ActivateInstruction {
            element_id: "end".to_string(),
            ancestor_scope_key: NO_KEY,
            variable_instructions: vec![
                VariableInstruction {
                    element_id: String::new(),
                    variables: [("total".to_string(), json!(42))].into(),
                },
                VariableInstruction {
                    element_id: "end".to_string(),
                    variables: [("local".to_string(), json!(true))].into(),
                },
            ],
        }),
    )
    .await;

    let variables: Vec<(String, i64)> = harness
        .log()
        .iter()
        .filter(|r| r.is_event() && r.value_type() == ValueType::Variable)
        .filter_map(|r| match &r.value {
            RecordValue::Variable(v) => Some((v.name.clone(), v.scope_key)),
            _ => None,
        })
        .collect();
    assert_eq!(variables, vec![("total".to_string(), instance)]);
    assert_eq!(harness.element_events("end", Intent::ElementCompleted).len(), 1);
    harness.close().await;
}

// ============================================================================
// Determinism
// ============================================================================

async fn run_scenario(harness: &mut EngineHarness) {
    harness.deploy(sub_process_process("shipping")).await;
    harness
        .deploy(multi_instance_process(|b, id| b.service_task(id), 2))
        .await;
    let shipping = harness.create_instance("shipping").await;
    harness.create_instance(PROCESS).await;

    let a = harness.element_key("A");
    complete(harness, a).await;
    let (_, inner) = multi_instance_events(harness, "work", Intent::ElementActivated);
    complete(harness, inner[0].key).await;

    let b = harness.element_key("B");
    let modification = ProcessInstanceModificationRecord::new(shipping)
        .activate_with(ActivateInstruction {
            element_id: "A".to_string(),
            ancestor_scope_key: NO_KEY,
            variable_instructions: vec![VariableInstruction {
                element_id: String::new(),
                variables: [("attempt".to_string(), json!(2))].into(),
            }],
        })
        .terminate(b);
    let response = modify(harness, modification).await;
    assert_eq!(response.record.intent(), Intent::Modified);
}

#[tokio::test]
async fn test_same_commands_give_same_state_and_records() {
    let mut first = EngineHarness::start();
    let mut second = EngineHarness::start();
    run_scenario(&mut first).await;
    run_scenario(&mut second).await;

    let first_log = first.log().to_vec();
    let second_log = second.log().to_vec();
    assert!(first_log.iter().any(|r| r.source_position != NO_KEY));
    let positions = |log: &[Record]| log.iter().map(|r| r.position).collect::<Vec<_>>();
    assert_eq!(positions(&first_log), positions(&second_log));
    assert_eq!(
        crate::protocol::encode_batch(&first_log).unwrap(),
        crate::protocol::encode_batch(&second_log).unwrap()
    );

    let first_db = first.close().await;
    let second_db = second.close().await;
    assert_eq!(first_db.checksum(), second_db.checksum());
}

// ============================================================================
// Migrations
// ============================================================================

#[test]
fn test_child_index_migration_rebuilds_missing_entries() {
    let mut db = Db::new();
    let record = ProcessInstanceRecord {
        bpmn_process_id: PROCESS.to_string(),
        version: 1,
        process_definition_key: 1,
        process_instance_key: 10,
        element_id: "task".to_string(),
        bpmn_element_type: BpmnElementType::ServiceTask,
        flow_scope_key: 10,
        via_sequence_flow: false,
    };
    let mut tx = db.transaction();
    ElementInstanceState::put(
        &mut tx,
        &ElementInstance {
            key: 11,
            lifecycle: ElementLifecycle::Activated,
            record,
            active_children: 0,
            active_sequence_flows: 0,
            finished_children: 0,
        },
    )
    .unwrap();
    tx.commit();

    let migrator = DbMigrator::new(migrations());
    assert_eq!(migrator.run_migrations(&mut db).unwrap(), 1);
    assert!(ElementInstanceState::has_child(&db.transaction(), 10, 11));

    assert_eq!(migrator.run_migrations(&mut db).unwrap(), 0);
}
