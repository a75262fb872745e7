//! Process instance modification across flow scopes, end to end.

use keel::protocol::{
    Intent, ProcessInstanceModificationRecord, RecordValue, RejectionType, ValueType, NO_KEY,
};
use keel::stream::CommandResponse;
use keel::test_utils::{sub_process_process, EngineHarness};

const PROCESS: &str = "shipping";

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

async fn complete(harness: &mut EngineHarness, element_id: &str) -> CommandResponse {
    let key = harness.element_key(element_id);
    let value = harness
        .log()
        .iter()
        .rev()
        .find(|r| r.key == key && r.value_type() == ValueType::ProcessInstance)
        .map(|r| r.value.clone())
        .unwrap();
    harness.execute(key, Intent::CompleteElement, value).await
}

#[tokio::test]
async fn test_move_token_out_of_sub_process_and_back() {
    let mut harness = EngineHarness::start();
    harness.deploy(sub_process_process(PROCESS)).await;
    let instance = harness.create_instance(PROCESS).await;
    complete(&mut harness, "A").await;
    assert_eq!(harness.active_elements(), vec![PROCESS, "sub", "B"]);
    let b = harness.element_key("B");

    // move the token from B back to A
    let response = modify(
        &mut harness,
        ProcessInstanceModificationRecord::new(instance)
            .activate("A")
            .terminate(b),
    )
    .await;
    assert_eq!(response.record.intent(), Intent::Modified);
    assert_eq!(harness.active_elements(), vec![PROCESS, "A"]);
    assert_eq!(harness.element_events("sub", Intent::ElementTerminated).len(), 1);
    assert!(harness
        .element_events(PROCESS, Intent::ElementTerminated)
        .is_empty());

    // the instance continues normally from there
    complete(&mut harness, "A").await;
    assert_eq!(harness.active_elements(), vec![PROCESS, "sub", "B"]);
    complete(&mut harness, "B").await;

    assert!(harness.active_elements().is_empty());
    let completed = harness.element_events(PROCESS, Intent::ElementCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].key, instance);
    harness.close().await;
}

#[tokio::test]
async fn test_rejected_modification_changes_nothing() {
    let mut harness = EngineHarness::start();
    harness.deploy(sub_process_process(PROCESS)).await;
    let instance = harness.create_instance(PROCESS).await;
    let events_before = harness.log().len();

    // one valid and one invalid instruction: nothing of it is applied
    let response = modify(
        &mut harness,
        ProcessInstanceModificationRecord::new(instance)
            .activate("B")
            .activate("does-not-exist"),
    )
    .await;

    assert_eq!(
        response.record.metadata.rejection_type,
        Some(RejectionType::InvalidArgument)
    );
    assert!(response
        .record
        .metadata
        .rejection_reason
        .contains("does-not-exist"));
    assert_eq!(harness.active_elements(), vec![PROCESS, "A"]);

    // the command and its rejection are the only new records
    assert_eq!(harness.log().len(), events_before + 2);
    harness.close().await;
}
