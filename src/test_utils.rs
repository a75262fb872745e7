//! Test utilities and in-memory helpers.
//!
//! Small dispatchers, a recording response writer and log readers, so tests
//! can drive a stream processor without a node around it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::dispatcher::{Dispatcher, DispatcherConfig, DispatcherMode, Fragment, PollAction, Subscription};
use crate::engine::model::{BpmnElementType, ProcessBuilder, ProcessDefinition};
use crate::protocol::{
    decode_batch, DeploymentRecord, Intent, ProcessInstanceCreationRecord, Record, RecordValue,
    ValueType, NO_KEY,
};
use crate::state::Db;
use crate::stream::{CommandResponse, CommandResponseWriter, LogStreamWriter, StreamProcessorHandle};

/// Partition size used by [`test_dispatcher`]. Max frame length is 4 KiB.
pub const TEST_PARTITION_SIZE: usize = 64 * 1024;

/// A small dispatcher for tests.
pub fn test_dispatcher(mode: DispatcherMode) -> Arc<Dispatcher> {
    let config = DispatcherConfig {
        name: "test-log".to_string(),
        partition_size: TEST_PARTITION_SIZE,
        partition_count: 3,
        mode,
        conductor_interval_ms: 1,
        ..Default::default()
    };
    match Dispatcher::start(config) {
        Ok(dispatcher) => Arc::new(dispatcher),
        Err(e) => panic!("test dispatcher config is invalid: {e}"),
    }
}

/// Read every committed record currently visible to `subscription`.
pub fn drain_records(subscription: &mut Subscription) -> Vec<Record> {
    let mut frames = Vec::new();
    loop {
        let read = subscription.poll(
            &mut |fragment: &Fragment<'_>| {
                frames.push((fragment.position, fragment.payload.to_vec()));
                PollAction::Consume
            },
            usize::MAX,
        );
        if read == 0 {
            break;
        }
    }
    frames
        .into_iter()
        .flat_map(|(position, payload)| match decode_batch(position, &payload) {
            Ok(records) => records,
            Err(e) => panic!("undecodable frame in test log: {e}"),
        })
        .collect()
}

/// Response writer that records every response.
#[derive(Default)]
pub struct RecordingResponseWriter {
    responses: Mutex<Vec<CommandResponse>>,
    received: Notify,
}

impl RecordingResponseWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn responses(&self) -> Vec<CommandResponse> {
        self.responses.lock().clone()
    }

    pub fn response_for(&self, request_id: i64) -> Option<CommandResponse> {
        self.responses
            .lock()
            .iter()
            .find(|r| r.request_id == request_id)
            .cloned()
    }

    /// Wait for the response to `request_id`.
    pub async fn wait_for(&self, request_id: i64, timeout: Duration) -> Option<CommandResponse> {
        let wait = async {
            loop {
                let notified = self.received.notified();
                if let Some(response) = self.response_for(request_id) {
                    return response;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }
}

#[async_trait]
impl CommandResponseWriter for RecordingResponseWriter {
    async fn send_response(&self, response: CommandResponse) {
        self.responses.lock().push(response);
        self.received.notify_waiters();
    }
}

// ============================================================================
// Process fixtures
// ============================================================================

/// `start -> task -> end`, with `task` a wait state.
pub fn one_task_process(bpmn_process_id: &str) -> ProcessDefinition {
    ProcessBuilder::new(bpmn_process_id)
        .start_event("start")
        .service_task("task")
        .end_event("end")
        .build()
}

/// `start -> A -> sub(start_sub -> B -> end_sub) -> end`, with `A` and `B`
/// wait states.
pub fn sub_process_process(bpmn_process_id: &str) -> ProcessDefinition {
    ProcessBuilder::new(bpmn_process_id)
        .start_event("start")
        .service_task("A")
        .sub_process("sub", |sub| {
            sub.start_event("start_sub")
                .service_task("B")
                .end_event("end_sub")
        })
        .end_event("end")
        .build()
}

/// Element type of `element_id` in `definition`.
pub fn element_type(definition: &ProcessDefinition, element_id: &str) -> Option<BpmnElementType> {
    definition
        .elements
        .iter()
        .find(|e| e.id == element_id)
        .map(|e| e.element_type)
}

// ============================================================================
// Engine harness
// ============================================================================

/// How long harness calls wait for the engine.
pub const ENGINE_TIMEOUT: Duration = Duration::from_secs(10);

/// A running engine on a test log, with a reader that sees every record.
pub struct EngineHarness {
    pub dispatcher: Arc<Dispatcher>,
    writer: LogStreamWriter,
    reader: Subscription,
    responses: Arc<RecordingResponseWriter>,
    handle: StreamProcessorHandle,
    log: Vec<Record>,
    next_request_id: i64,
}

impl EngineHarness {
    pub fn start() -> Self {
        let dispatcher = test_dispatcher(DispatcherMode::PubSub);
        let reader = dispatcher.open_subscription("harness-reader");
        let responses = RecordingResponseWriter::new();
        let handle = match crate::engine::stream_processor(Arc::clone(&dispatcher))
            .response_writer(responses.clone())
            .build()
        {
            Ok(processor) => processor.start(),
            Err(e) => panic!("engine stream processor failed to build: {e}"),
        };

        Self {
            writer: LogStreamWriter::new(Arc::clone(&dispatcher), 0),
            dispatcher,
            reader,
            responses,
            handle,
            log: Vec::new(),
            next_request_id: 1,
        }
    }

    /// Write a command, wait for its response and for the engine to settle.
    pub async fn execute(&mut self, key: i64, intent: Intent, value: RecordValue) -> CommandResponse {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let command = Record::command(key, intent, value).with_request(request_id, 0);
        if let Err(e) = self.writer.write(&[command]).await {
            panic!("failed to write command: {e}");
        }
        let Some(response) = self.responses.wait_for(request_id, ENGINE_TIMEOUT).await else {
            panic!("no response to request {request_id}");
        };
        assert!(self.handle.settle(ENGINE_TIMEOUT).await, "engine did not settle");
        response
    }

    /// Deploy `definition`, asserting it was accepted. Returns the process
    /// definition key.
    pub async fn deploy(&mut self, definition: ProcessDefinition) -> i64 {
        let response = self
            .execute(
                NO_KEY,
                Intent::Create,
                RecordValue::Deployment(DeploymentRecord {
                    resources: vec![definition],
                    processes: Vec::new(),
                }),
            )
            .await;
        match &response.record.value {
            RecordValue::Deployment(deployment) if response.record.is_event() => {
                deployment.processes[0].key
            }
            _ => panic!(
                "deployment rejected: {}",
                response.record.metadata.rejection_reason
            ),
        }
    }

    /// Create an instance of the latest version. Returns its key.
    pub async fn create_instance(&mut self, bpmn_process_id: &str) -> i64 {
        let response = self
            .execute(
                NO_KEY,
                Intent::Create,
                RecordValue::ProcessInstanceCreation(ProcessInstanceCreationRecord::latest(
                    bpmn_process_id,
                )),
            )
            .await;
        assert!(
            response.record.is_event(),
            "creation rejected: {}",
            response.record.metadata.rejection_reason
        );
        response.record.key
    }

    /// Every record written so far.
    pub fn log(&mut self) -> &[Record] {
        let records = drain_records(&mut self.reader);
        self.log.extend(records);
        &self.log
    }

    /// Process instance events of `element_id` with `intent`, in log order.
    pub fn element_events(&mut self, element_id: &str, intent: Intent) -> Vec<Record> {
        self.log()
            .iter()
            .filter(|r| r.is_event() && r.value_type() == ValueType::ProcessInstance)
            .filter(|r| r.intent() == intent)
            .filter(|r| matches!(&r.value, RecordValue::ProcessInstance(v) if v.element_id == element_id))
            .cloned()
            .collect()
    }

    /// Key of the most recently activated instance of `element_id`.
    pub fn element_key(&mut self, element_id: &str) -> i64 {
        match self.element_events(element_id, Intent::ElementActivated).last() {
            Some(record) => record.key,
            None => panic!("element '{element_id}' was never activated"),
        }
    }

    /// Element ids with an activated instance that has not completed or
    /// terminated yet, in activation order.
    pub fn active_elements(&mut self) -> Vec<String> {
        let mut active: Vec<(i64, String)> = Vec::new();
        for record in self.log() {
            let RecordValue::ProcessInstance(value) = &record.value else {
                continue;
            };
            if !record.is_event() {
                continue;
            }
            match record.intent() {
                Intent::ElementActivated => active.push((record.key, value.element_id.clone())),
                Intent::ElementCompleted | Intent::ElementTerminated => {
                    active.retain(|(key, _)| *key != record.key)
                }
                _ => {}
            }
        }
        active.into_iter().map(|(_, id)| id).collect()
    }

    pub fn handle(&self) -> &StreamProcessorHandle {
        &self.handle
    }

    /// Stop the engine and hand back its state.
    pub async fn close(self) -> Db {
        match self.handle.close().await {
            Ok(db) => db,
            Err(e) => panic!("engine failed: {e}"),
        }
    }
}
