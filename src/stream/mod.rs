//! Deterministic record stream processing.
//!
//! A [`StreamProcessor`] owns the keyed state of one partition and consumes
//! the committed log in position order. For every command it resolves the
//! processor registered for `(record type, value type, intent)`, runs it in
//! one state transaction, writes all follow-up records as one log batch and
//! commits. A failing command is rolled back and answered with a
//! `PROCESSING_ERROR` rejection instead.
//!
//! Events are applied to state by [`EventAppliers`] at the moment they are
//! appended, and again during replay after a restart.

mod appliers;
mod context;
mod log_writer;
mod processor;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

pub use appliers::{EventApplier, EventAppliers};
pub use context::ProcessingContext;
pub use log_writer::LogStreamWriter;
pub use processor::{Phase, StreamProcessor, StreamProcessorBuilder, StreamProcessorHandle};

use crate::dispatcher::DispatcherError;
use crate::state::migration::MigrationError;
use crate::protocol::{Intent, ProtocolError, Record, RecordType, ValueType};
use crate::state::StateError;

/// Result type for processing operations.
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// Errors raised while processing records.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Record error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Dispatcher error: {0}")]
    Dispatcher(#[from] DispatcherError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Expected {expected:?} value but got {actual:?}")]
    UnexpectedValue {
        expected: ValueType,
        actual: ValueType,
    },

    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    #[error("{0}")]
    Failed(String),

    #[error("Follow-up batch of {size} bytes exceeds max frame length {max_frame_length}")]
    BatchTooLarge { size: usize, max_frame_length: usize },

    #[error("Log is not accepting writes")]
    Backpressure,

    #[error("Stream processor task failed: {0}")]
    Task(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Stream processor configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Partition this processor owns. Encoded into generated keys.
    pub partition_id: i32,
    /// Frames read per poll during replay and export.
    pub max_frames_per_poll: usize,
    /// Sleep when the log has nothing new.
    pub idle_backoff_ms: u64,
    /// Stream id stamped on follow-up frames.
    pub stream_id: i32,
    /// Snapshot recovered on start and written on close.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            partition_id: 1,
            max_frames_per_poll: 64,
            idle_backoff_ms: 5,
            stream_id: 0,
            snapshot_path: None,
        }
    }
}

// ============================================================================
// Processors
// ============================================================================

/// Handles one kind of command.
///
/// Implementations mutate state only by appending events through the
/// context, never directly, so replay reproduces the same state.
pub trait TypedRecordProcessor: Send + Sync {
    fn process_record(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<()>;
}

/// Processors keyed by `(record type, value type, intent)`, resolved once at
/// startup.
#[derive(Default)]
pub struct RecordProcessors {
    processors: HashMap<(RecordType, ValueType, Intent), Arc<dyn TypedRecordProcessor>>,
}

impl RecordProcessors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command processor. A later registration for the same key
    /// replaces the earlier one.
    pub fn on_command(
        &mut self,
        value_type: ValueType,
        intent: Intent,
        processor: Arc<dyn TypedRecordProcessor>,
    ) -> &mut Self {
        self.processors
            .insert((RecordType::Command, value_type, intent), processor);
        self
    }

    pub fn get(&self, record: &Record) -> Option<&Arc<dyn TypedRecordProcessor>> {
        self.processors
            .get(&(record.record_type(), record.value_type(), record.intent()))
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Answer to a command that carried a request id.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub request_id: i64,
    pub request_stream_id: i32,
    /// The resulting event, or the rejection.
    pub record: Record,
}

/// Delivers command responses once their transaction committed.
#[async_trait]
pub trait CommandResponseWriter: Send + Sync {
    async fn send_response(&self, response: CommandResponse);
}

/// Drops all responses.
pub struct NoopResponseWriter;

#[async_trait]
impl CommandResponseWriter for NoopResponseWriter {
    async fn send_response(&self, _response: CommandResponse) {}
}
