//! Records flowing through the log.
//!
//! A record is a command, an event, or a command rejection. Commands
//! request a state change; events are facts produced while processing a
//! command; rejections answer a command that failed validation.
//!
//! All follow-up records of one command are written as one log frame (a
//! batch). The `i`-th record of a batch read at frame position `p` has
//! position `p + i`.

mod value;

use serde::{Deserialize, Serialize};

pub use value::{
    ActivateInstruction, DeploymentRecord, ProcessInstanceCreationRecord,
    ProcessInstanceModificationRecord, ProcessInstanceRecord, ProcessMetadata, ProcessRecord,
    RecordValue, TerminateInstruction, VariableInstruction, VariableRecord,
};

/// Result type for record encoding.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding record batches.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Failed to encode record batch: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode record batch at position {position}: {source}")]
    Decode {
        position: i64,
        #[source]
        source: serde_json::Error,
    },
}

/// Marker for "no key"/"no position".
pub const NO_KEY: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    Command,
    Event,
    CommandRejection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Deployment,
    Process,
    ProcessInstance,
    ProcessInstanceCreation,
    ProcessInstanceModification,
    Variable,
}

/// The verb of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    // commands
    Create,
    ActivateElement,
    CompleteElement,
    TerminateElement,
    Cancel,
    Modify,
    // events
    Created,
    Updated,
    Modified,
    ElementActivating,
    ElementActivated,
    ElementCompleting,
    ElementCompleted,
    ElementTerminating,
    ElementTerminated,
    SequenceFlowTaken,
}

impl Intent {
    /// Intents that describe an element instance lifecycle transition.
    pub fn is_element_lifecycle(&self) -> bool {
        matches!(
            self,
            Intent::ElementActivating
                | Intent::ElementActivated
                | Intent::ElementCompleting
                | Intent::ElementCompleted
                | Intent::ElementTerminating
                | Intent::ElementTerminated
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionType {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    InvalidState,
    ProcessingError,
    ExceededBatchRecordSize,
}

/// Routing and bookkeeping data carried by every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub record_type: RecordType,
    pub value_type: ValueType,
    pub intent: Intent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_type: Option<RejectionType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rejection_reason: String,
    /// Set on commands that expect a response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_stream_id: Option<i32>,
}

/// One record of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Assigned when read back from the log; not serialized.
    #[serde(skip, default = "no_position")]
    pub position: i64,
    /// Position of the command this record follows up, or `NO_KEY`.
    pub source_position: i64,
    pub key: i64,
    #[serde(flatten)]
    pub metadata: RecordMetadata,
    pub value: RecordValue,
}

fn no_position() -> i64 {
    NO_KEY
}

impl Record {
    /// A client command, not yet written.
    pub fn command(key: i64, intent: Intent, value: RecordValue) -> Self {
        Self::new(RecordType::Command, key, intent, value)
    }

    /// An event, not yet written.
    pub fn event(key: i64, intent: Intent, value: RecordValue) -> Self {
        Self::new(RecordType::Event, key, intent, value)
    }

    fn new(record_type: RecordType, key: i64, intent: Intent, value: RecordValue) -> Self {
        Self {
            position: NO_KEY,
            source_position: NO_KEY,
            key,
            metadata: RecordMetadata {
                record_type,
                value_type: value.value_type(),
                intent,
                rejection_type: None,
                rejection_reason: String::new(),
                request_id: None,
                request_stream_id: None,
            },
            value,
        }
    }

    /// Attach a request so the processor answers it.
    pub fn with_request(mut self, request_id: i64, request_stream_id: i32) -> Self {
        self.metadata.request_id = Some(request_id);
        self.metadata.request_stream_id = Some(request_stream_id);
        self
    }

    pub fn record_type(&self) -> RecordType {
        self.metadata.record_type
    }

    pub fn value_type(&self) -> ValueType {
        self.metadata.value_type
    }

    pub fn intent(&self) -> Intent {
        self.metadata.intent
    }

    pub fn is_command(&self) -> bool {
        self.metadata.record_type == RecordType::Command
    }

    pub fn is_event(&self) -> bool {
        self.metadata.record_type == RecordType::Event
    }

    /// Rejection of `command` carrying the command's value and request.
    pub fn rejection(command: &Record, rejection_type: RejectionType, reason: &str) -> Self {
        let mut rejection = command.clone();
        rejection.position = NO_KEY;
        rejection.metadata.record_type = RecordType::CommandRejection;
        rejection.metadata.rejection_type = Some(rejection_type);
        rejection.metadata.rejection_reason = reason.to_string();
        rejection
    }
}

/// Serialize a batch of records into one frame payload.
pub fn encode_batch(records: &[Record]) -> Result<Vec<u8>> {
    serde_json::to_vec(records).map_err(ProtocolError::Encode)
}

/// Decode a frame payload read at `frame_position`, the position just past
/// the frame.
///
/// The last record takes the frame position and the ones before it count
/// down from there. A batch never holds more records than its payload has
/// bytes, so every position stays inside the frame's own byte range and
/// positions keep increasing across frames.
pub fn decode_batch(frame_position: i64, payload: &[u8]) -> Result<Vec<Record>> {
    let mut records: Vec<Record> =
        serde_json::from_slice(payload).map_err(|source| ProtocolError::Decode {
            position: frame_position,
            source,
        })?;
    let last = records.len() as i64 - 1;
    for (index, record) in records.iter_mut().enumerate() {
        record.position = frame_position - (last - index as i64);
    }
    Ok(records)
}
