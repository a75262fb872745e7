//! Subject-keyed message handlers.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::{Address, ProtocolReply, ProtocolRequest, ReplyStatus};

/// Error returned by a replying handler. Its message is sent back to the
/// requester.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a replying handler.
pub type HandlerResult = std::result::Result<Bytes, HandlerError>;

type FireAndForgetFn = dyn Fn(Address, Bytes) + Send + Sync;
type SyncFn = dyn Fn(Address, Bytes) -> HandlerResult + Send + Sync;
type AsyncFn = dyn Fn(Address, Bytes) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// The three handler shapes.
#[derive(Clone)]
pub(crate) enum MessageHandler {
    /// Consumes the message, never replies.
    FireAndForget(Arc<FireAndForgetFn>),
    /// Blocking handler, run off the I/O tasks.
    Sync(Arc<SyncFn>),
    /// Returns a future resolving to the reply.
    Async(Arc<AsyncFn>),
}

impl MessageHandler {
    pub(crate) fn fire_and_forget<F>(handler: F) -> Self
    where
        F: Fn(Address, Bytes) + Send + Sync + 'static,
    {
        MessageHandler::FireAndForget(Arc::new(handler))
    }

    pub(crate) fn sync<F>(handler: F) -> Self
    where
        F: Fn(Address, Bytes) -> HandlerResult + Send + Sync + 'static,
    {
        MessageHandler::Sync(Arc::new(handler))
    }

    pub(crate) fn future<F, Fut>(handler: F) -> Self
    where
        F: Fn(Address, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        MessageHandler::Async(Arc::new(move |sender, payload| {
            Box::pin(handler(sender, payload)) as BoxFuture<'static, HandlerResult>
        }))
    }
}

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: DashMap<String, MessageHandler>,
}

impl HandlerRegistry {
    pub(crate) fn register(&self, subject: impl Into<String>, handler: MessageHandler) {
        self.handlers.insert(subject.into(), handler);
    }

    pub(crate) fn unregister(&self, subject: &str) -> bool {
        self.handlers.remove(subject).is_some()
    }

    /// Run the handler for `request`. `None` means no reply is sent.
    pub(crate) async fn dispatch(&self, request: ProtocolRequest) -> Option<ProtocolReply> {
        let ProtocolRequest {
            id,
            sender,
            subject,
            payload,
        } = request;

        let Some(handler) = self.handlers.get(&subject).map(|h| h.value().clone()) else {
            debug!(subject = %subject, sender = %sender, "No handler for message subject");
            return Some(ProtocolReply::failure(id, ReplyStatus::ErrorNoHandler, None));
        };

        let result = match handler {
            MessageHandler::FireAndForget(handler) => {
                if let Err(e) = tokio::task::spawn_blocking(move || handler(sender, payload)).await {
                    warn!(subject = %subject, error = %e, "Unexpected error while handling message");
                }
                return None;
            }
            MessageHandler::Sync(handler) => {
                match tokio::task::spawn_blocking(move || handler(sender, payload)).await {
                    Ok(result) => result,
                    Err(e) => Err(e.to_string().into()),
                }
            }
            MessageHandler::Async(handler) => handler(sender, payload).await,
        };

        Some(match result {
            Ok(payload) => ProtocolReply::ok(id, payload),
            Err(e) => {
                warn!(subject = %subject, error = %e, "Unexpected error while handling message");
                let message = e.to_string();
                ProtocolReply::failure(
                    id,
                    ReplyStatus::ErrorHandlerException,
                    (!message.is_empty()).then_some(message),
                )
            }
        })
    }
}
