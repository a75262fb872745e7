//! Command gateway.
//!
//! Accepts commands from other cluster members over the messaging
//! transport, writes them to the log and answers with the engine's
//! response once the command's transaction committed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{NodeError, Result};
use crate::dispatcher::Dispatcher;
use crate::protocol::Record;
use crate::stream::{CommandResponse, CommandResponseWriter, LogStreamWriter};
use crate::transport::{Address, HandlerError, HandlerResult, MessagingService};

/// Subject commands are sent on. Payload and reply are JSON records.
pub const COMMAND_SUBJECT: &str = "command";
/// Liveness subject. Replies with the node's advertised address.
pub const PING_SUBJECT: &str = "ping";

/// Writes commands to the log and routes the engine's responses back to
/// the callers waiting on them.
pub struct CommandGateway {
    writer: LogStreamWriter,
    stream_id: i32,
    timeout: Duration,
    next_request_id: AtomicI64,
    pending: DashMap<i64, oneshot::Sender<CommandResponse>>,
}

impl CommandGateway {
    pub fn new(dispatcher: Arc<Dispatcher>, stream_id: i32, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            writer: LogStreamWriter::new(dispatcher, stream_id),
            stream_id,
            timeout,
            next_request_id: AtomicI64::new(1),
            pending: DashMap::new(),
        })
    }

    /// Write `command` and wait for the resulting event or rejection.
    pub async fn execute(&self, command: Record) -> Result<Record> {
        if !command.is_command() {
            return Err(NodeError::InvalidCommand(format!(
                "expected a command, got {:?}",
                command.record_type()
            )));
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        let command = command.with_request(request_id, self.stream_id);
        if let Err(e) = self.writer.write(&[command]).await {
            self.pending.remove(&request_id);
            return Err(e.into());
        }
        debug!(request_id, "Command written");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response.record),
            Ok(Err(_)) => Err(NodeError::ResponseDropped { request_id }),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(NodeError::ResponseTimeout {
                    request_id,
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Commands written but not answered yet.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Serve [`COMMAND_SUBJECT`] and [`PING_SUBJECT`] on `messaging`.
    pub fn register(self: &Arc<Self>, messaging: &MessagingService) {
        let gateway = Arc::clone(self);
        messaging.register_async_handler(COMMAND_SUBJECT, move |sender: Address, payload: Bytes| {
            let gateway = Arc::clone(&gateway);
            async move { gateway.handle_command(sender, payload).await }
        });

        let address = messaging.address();
        messaging.register_sync_handler(PING_SUBJECT, move |_sender: Address, _payload: Bytes| {
            Ok(Bytes::from(address.to_string()))
        });
    }

    async fn handle_command(&self, sender: Address, payload: Bytes) -> HandlerResult {
        let command: Record = serde_json::from_slice(&payload)
            .map_err(|e| HandlerError::from(format!("malformed command: {e}")))?;
        debug!(%sender, value_type = ?command.value_type(), intent = ?command.intent(), "Command received");

        let record = self.execute(command).await?;
        Ok(Bytes::from(serde_json::to_vec(&record)?))
    }
}

#[async_trait]
impl CommandResponseWriter for CommandGateway {
    async fn send_response(&self, response: CommandResponse) {
        let request_id = response.request_id;
        match self.pending.remove(&request_id) {
            Some((_, waiter)) => {
                // the caller may have timed out in between
                let _ = waiter.send(response);
            }
            None => {
                warn!(request_id, "Response for unknown request dropped");
            }
        }
    }
}
