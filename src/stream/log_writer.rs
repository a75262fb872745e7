//! Batch writes into the log.

use std::sync::Arc;

use backon::Retryable;
use tracing::trace;

use super::{ProcessingError, Result};
use crate::dispatcher::{Claim, Dispatcher};
use crate::protocol::{encode_batch, Record};
use crate::utils::retry::backpressure_backoff;

/// Writes record batches as single frames.
#[derive(Debug, Clone)]
pub struct LogStreamWriter {
    dispatcher: Arc<Dispatcher>,
    stream_id: i32,
}

impl LogStreamWriter {
    pub fn new(dispatcher: Arc<Dispatcher>, stream_id: i32) -> Self {
        Self {
            dispatcher,
            stream_id,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Write `records` as one frame without waiting.
    ///
    /// Returns the frame position, which is the position of the last record
    /// in the batch, or [`ProcessingError::Backpressure`] if the publisher
    /// limit refuses the frame.
    pub fn try_write(&self, records: &[Record]) -> Result<i64> {
        let payload = encode_batch(records)?;
        let max_frame_length = self.dispatcher.max_frame_length();
        if payload.len() >= max_frame_length {
            return Err(ProcessingError::BatchTooLarge {
                size: payload.len(),
                max_frame_length,
            });
        }

        loop {
            match self.dispatcher.claim(payload.len(), self.stream_id)? {
                Claim::Claimed(position, mut fragment) => {
                    fragment.buffer().copy_from_slice(&payload);
                    fragment.commit();
                    trace!(position, records = records.len(), "Batch written");
                    return Ok(position);
                }
                // the claim rolled the log over to a fresh partition
                Claim::PartitionFilled => continue,
                Claim::Backpressure => return Err(ProcessingError::Backpressure),
            }
        }
    }

    /// Write `records` as one frame, retrying while the log applies
    /// backpressure.
    pub async fn write(&self, records: &[Record]) -> Result<i64> {
        (|| async { self.try_write(records) })
            .retry(backpressure_backoff())
            .when(|e| matches!(e, ProcessingError::Backpressure))
            .await
    }
}
