//! One open connection after the handshake.
//!
//! A channel owns a reader task and a writer task. Outbound messages are
//! queued to the writer; inbound replies complete pending requests by id and
//! inbound requests are dispatched to the handler registry. Closing the
//! channel fails every pending request with `ConnectionClosed`.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use super::handlers::HandlerRegistry;
use super::protocol::request_id;
use super::stage::FramePipeline;
use super::{
    Address, MessagingError, ProtocolMessage, ProtocolReply, ProtocolRequest, ProtocolVersion,
    ReplyStatus, Result,
};

/// Byte stream a channel runs on: plain TCP, TLS or an in-memory pipe.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub(crate) type BoxedStream = Box<dyn AsyncStream>;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

type PendingReply = oneshot::Sender<Result<ProtocolReply>>;

struct Shared {
    remote: Address,
    pending: DashMap<i64, PendingReply>,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
}

impl Shared {
    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_signal.send_replace(true);

        let ids: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            debug!(remote = %self.remote, pending = ids.len(), reason, "Failing pending requests");
        }
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(MessagingError::ConnectionClosed(reason.to_string())));
            }
        }
    }
}

pub(crate) struct Channel {
    id: u64,
    version: ProtocolVersion,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<ProtocolMessage>,
    next_request_id: AtomicI64,
}

impl Channel {
    /// Start the reader and writer tasks on a handshaken stream.
    pub(crate) fn spawn(
        stream: BoxedStream,
        version: ProtocolVersion,
        pipeline: Arc<FramePipeline>,
        handlers: Arc<HandlerRegistry>,
        remote: Address,
        max_frame_length: usize,
    ) -> Arc<Self> {
        let (close_signal, close_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            remote,
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            close_signal,
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (reader, writer) = tokio::io::split(stream);

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            version,
            Arc::clone(&pipeline),
            Arc::clone(&shared),
            close_rx.clone(),
        ));
        tokio::spawn(read_loop(
            reader,
            outbound.clone(),
            version,
            pipeline,
            handlers,
            Arc::clone(&shared),
            close_rx,
            max_frame_length,
        ));

        let channel = Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            version,
            shared,
            outbound,
            next_request_id: AtomicI64::new(1),
        });
        debug!(channel = channel.id, remote = %channel.remote(), version = version.version(), "Channel open");
        channel
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub(crate) fn remote(&self) -> &Address {
        &self.shared.remote
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self, reason: &str) {
        if !self.is_closed() {
            debug!(channel = self.id, remote = %self.remote(), reason, "Closing channel");
        }
        self.shared.close(reason);
    }

    fn request(&self, sender: &Address, subject: &str, payload: Bytes) -> ProtocolRequest {
        ProtocolRequest {
            id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            sender: sender.clone(),
            subject: subject.to_string(),
            payload,
        }
    }

    /// Queue a request without waiting for a reply.
    pub(crate) fn send_async(&self, sender: &Address, subject: &str, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(MessagingError::ConnectionClosed(format!("channel to {} is closed", self.remote())));
        }
        let request = self.request(sender, subject, payload);
        self.outbound
            .send(ProtocolMessage::Request(request))
            .map_err(|_| MessagingError::ConnectionClosed(format!("channel to {} is closed", self.remote())))
    }

    /// Send a request and wait for its reply.
    pub(crate) async fn send_and_receive(
        &self,
        sender: &Address,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes> {
        let request = self.request(sender, subject, payload);
        let id = request.id;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.insert(id, reply_tx);

        // A close racing the insert above may already have drained the map.
        if self.is_closed() || self.outbound.send(ProtocolMessage::Request(request)).is_err() {
            self.shared.pending.remove(&id);
            return Err(MessagingError::ConnectionClosed(format!("channel to {} is closed", self.remote())));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(Ok(reply))) => reply.into_result(subject),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(MessagingError::ConnectionClosed(format!(
                "channel to {} dropped the request",
                self.remote()
            ))),
            Err(_) => {
                self.shared.pending.remove(&id);
                Err(MessagingError::Timeout {
                    address: self.remote().clone(),
                    subject: subject.to_string(),
                    timeout,
                })
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shared.close("channel dropped");
    }
}

// ============================================================================
// I/O tasks
// ============================================================================

async fn write_loop<W>(
    writer: W,
    mut outbound: mpsc::UnboundedReceiver<ProtocolMessage>,
    version: ProtocolVersion,
    pipeline: Arc<FramePipeline>,
    shared: Arc<Shared>,
    mut close_rx: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    'write: loop {
        let first = tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = close_rx.wait_for(|closed| *closed) => break,
        };

        // Write what is already queued before flushing.
        let mut batch = vec![first];
        while let Ok(message) = outbound.try_recv() {
            batch.push(message);
        }
        for message in batch {
            match write_message(&mut writer, &message, version, &pipeline).await {
                Ok(()) => {}
                Err(MessagingError::Io(e)) => {
                    warn!(remote = %shared.remote, error = %e, "Failed to write to channel");
                    shared.close("write failed");
                    break 'write;
                }
                Err(e) => fail_request(&shared, &message, e),
            }
        }
        if let Err(e) = writer.flush().await {
            warn!(remote = %shared.remote, error = %e, "Failed to flush channel");
            shared.close("write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// A message that could not be encoded is lost on its own; the channel stays
/// open.
fn fail_request(shared: &Shared, message: &ProtocolMessage, error: MessagingError) {
    warn!(remote = %shared.remote, id = message.id(), error = %error, "Failed to encode message");
    if let ProtocolMessage::Request(request) = message {
        if let Some((_, reply)) = shared.pending.remove(&request.id) {
            let _ = reply.send(Err(error));
        }
    }
}

async fn write_message<W>(
    writer: &mut W,
    message: &ProtocolMessage,
    version: ProtocolVersion,
    pipeline: &FramePipeline,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = pipeline.encode(version.encode(message))?;
    writer.write_u32(frame.len() as u32).await?;
    writer.write_all(&frame).await?;
    trace!(id = message.id(), bytes = frame.len(), "Frame written");
    Ok(())
}

async fn read_frame<R>(reader: &mut R, max_frame_length: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let length = reader.read_u32().await? as usize;
    if length > max_frame_length {
        return Err(MessagingError::ProtocolException(format!(
            "frame of {length} bytes exceeds max frame length {max_frame_length}"
        )));
    }
    let mut frame = vec![0u8; length];
    reader.read_exact(&mut frame).await?;
    Ok(Bytes::from(frame))
}

#[allow(clippy::too_many_arguments)]
async fn read_loop<R>(
    mut reader: R,
    outbound: mpsc::UnboundedSender<ProtocolMessage>,
    version: ProtocolVersion,
    pipeline: Arc<FramePipeline>,
    handlers: Arc<HandlerRegistry>,
    shared: Arc<Shared>,
    mut close_rx: watch::Receiver<bool>,
    max_frame_length: usize,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, max_frame_length) => frame,
            _ = close_rx.wait_for(|closed| *closed) => return,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(MessagingError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(remote = %shared.remote, "Channel closed by peer");
                shared.close("connection closed by peer");
                return;
            }
            Err(e) => {
                warn!(remote = %shared.remote, error = %e, "Failed to read from channel");
                shared.close("read failed");
                return;
            }
        };

        let body = match pipeline.decode(frame) {
            Ok(body) => body,
            Err(e) => {
                warn!(remote = %shared.remote, error = %e, "Dropping undecodable frame");
                continue;
            }
        };

        match version.decode(body.clone()) {
            Ok(ProtocolMessage::Reply(reply)) => match shared.pending.remove(&reply.id) {
                Some((_, pending)) => {
                    let _ = pending.send(Ok(reply));
                }
                None => debug!(remote = %shared.remote, id = reply.id, "Reply for unknown request"),
            },
            Ok(ProtocolMessage::Request(request)) => {
                let handlers = Arc::clone(&handlers);
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    if let Some(reply) = handlers.dispatch(request).await {
                        let _ = outbound.send(ProtocolMessage::Reply(reply));
                    }
                });
            }
            Err(e) => {
                warn!(remote = %shared.remote, error = %e, "Received malformed message");
                if let Some(id) = request_id(&body) {
                    let reply = ProtocolReply::failure(id, ReplyStatus::ProtocolException, Some(e.to_string()));
                    let _ = outbound.send(ProtocolMessage::Reply(reply));
                }
            }
        }
    }
}
