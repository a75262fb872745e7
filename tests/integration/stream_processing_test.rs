//! Engine restarts: replay and snapshot recovery through the public API.

use std::sync::Arc;

use keel::dispatcher::{Dispatcher, DispatcherMode};
use keel::protocol::{
    DeploymentRecord, Intent, ProcessInstanceCreationRecord, Record, RecordValue, NO_KEY,
};
use keel::stream::{LogStreamWriter, Phase, ProcessingConfig, StreamProcessorHandle};
use keel::test_utils::{
    one_task_process, test_dispatcher, RecordingResponseWriter, ENGINE_TIMEOUT,
};

const PROCESS: &str = "invoice";

fn start_engine(
    dispatcher: &Arc<Dispatcher>,
    config: ProcessingConfig,
    responses: &Arc<RecordingResponseWriter>,
) -> StreamProcessorHandle {
    keel::engine::stream_processor(Arc::clone(dispatcher))
        .config(config)
        .response_writer(responses.clone())
        .build()
        .unwrap()
        .start()
}

async fn execute(
    writer: &LogStreamWriter,
    responses: &RecordingResponseWriter,
    request_id: i64,
    value: RecordValue,
) -> Record {
    let command = Record::command(NO_KEY, Intent::Create, value).with_request(request_id, 0);
    writer.write(&[command]).await.unwrap();
    responses
        .wait_for(request_id, ENGINE_TIMEOUT)
        .await
        .unwrap()
        .record
}

fn deployment() -> RecordValue {
    RecordValue::Deployment(DeploymentRecord {
        resources: vec![one_task_process(PROCESS)],
        processes: Vec::new(),
    })
}

fn creation() -> RecordValue {
    RecordValue::ProcessInstanceCreation(ProcessInstanceCreationRecord::latest(PROCESS))
}

#[tokio::test]
async fn test_restarted_engine_replays_and_continues() {
    let dispatcher = test_dispatcher(DispatcherMode::PubSub);
    let writer = LogStreamWriter::new(Arc::clone(&dispatcher), 0);

    let responses = RecordingResponseWriter::new();
    let engine = start_engine(&dispatcher, ProcessingConfig::default(), &responses);
    assert!(execute(&writer, &responses, 1, deployment()).await.is_event());
    let first = execute(&writer, &responses, 2, creation()).await;
    assert!(first.is_event());
    assert!(engine.settle(ENGINE_TIMEOUT).await);
    let before = engine.close().await.unwrap();

    let published = dispatcher.publisher_position();
    let responses = RecordingResponseWriter::new();
    let engine = start_engine(&dispatcher, ProcessingConfig::default(), &responses);
    assert!(engine.settle(ENGINE_TIMEOUT).await);
    // replay writes nothing and answers nobody
    assert_eq!(dispatcher.publisher_position(), published);
    assert!(responses.responses().is_empty());

    let second = execute(&writer, &responses, 3, creation()).await;
    assert!(second.is_event(), "{}", second.metadata.rejection_reason);
    assert!(second.key > first.key);

    let after = engine.close().await.unwrap();
    assert_ne!(before, after);
}

#[tokio::test]
async fn test_snapshot_carries_deployments_to_a_fresh_log() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProcessingConfig {
        snapshot_path: Some(dir.path().join("partition-1.snapshot")),
        ..Default::default()
    };

    let dispatcher = test_dispatcher(DispatcherMode::PubSub);
    let writer = LogStreamWriter::new(Arc::clone(&dispatcher), 0);
    let responses = RecordingResponseWriter::new();
    let engine = start_engine(&dispatcher, config.clone(), &responses);
    assert!(execute(&writer, &responses, 1, deployment()).await.is_event());
    assert!(engine.settle(ENGINE_TIMEOUT).await);
    engine.close().await.unwrap();
    assert!(dir.path().join("partition-1.snapshot").exists());

    // the deployment lives only in the snapshot now
    let fresh = test_dispatcher(DispatcherMode::PubSub);
    let writer = LogStreamWriter::new(Arc::clone(&fresh), 0);
    let responses = RecordingResponseWriter::new();
    let engine = start_engine(&fresh, config, &responses);
    // positions restart on a fresh log, so write only after replay
    assert!(engine.wait_for_phase(Phase::Processing, ENGINE_TIMEOUT).await);

    let created = execute(&writer, &responses, 2, creation()).await;
    assert!(created.is_event(), "{}", created.metadata.rejection_reason);

    engine.close().await.unwrap();
}
