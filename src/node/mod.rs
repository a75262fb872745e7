//! Node runtime.
//!
//! Wires one partition together: the log dispatcher, the engine's stream
//! processor, an optional exporter stage behind it and the messaging
//! transport through which other members submit commands.

mod gateway;

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{info, warn};

pub use gateway::{CommandGateway, COMMAND_SUBJECT, PING_SUBJECT};

use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherError};
use crate::export::{ExportError, ExporterDirector, ExporterDirectorHandle, LoggingExporter};
use crate::stream::{ProcessingError, StreamProcessorHandle};
use crate::transport::{Address, MessagingError, MessagingService};
use crate::utils::retry::connection_backoff;

/// Errors from the node runtime.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Dispatcher error: {0}")]
    Dispatcher(#[from] DispatcherError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("No response to request {request_id} within {timeout:?}")]
    ResponseTimeout { request_id: i64, timeout: Duration },

    #[error("Response to request {request_id} was dropped")]
    ResponseDropped { request_id: i64 },
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Node wiring configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Members pinged on start, as `host:port`.
    pub peers: Vec<String>,
    /// Log every processed record through an exporter. Requires pipeline
    /// mode.
    pub export_records: bool,
    /// How long a command submitted through the gateway waits for its
    /// response.
    pub command_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            export_records: false,
            command_timeout_ms: 10_000,
        }
    }
}

/// A running node.
pub struct Node {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    processor: StreamProcessorHandle,
    exporter: Option<ExporterDirectorHandle>,
    messaging: Arc<MessagingService>,
    gateway: Arc<CommandGateway>,
}

impl Node {
    /// Start every component, log first and transport last.
    pub async fn start(config: Config) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::start(config.dispatcher.clone())?);
        info!(
            log = %dispatcher.name(),
            mode = ?dispatcher.mode(),
            max_frame_length = dispatcher.max_frame_length(),
            "Log dispatcher started"
        );

        let gateway = CommandGateway::new(
            Arc::clone(&dispatcher),
            config.processing.stream_id,
            Duration::from_millis(config.node.command_timeout_ms),
        );

        let processor = crate::engine::stream_processor(Arc::clone(&dispatcher))
            .config(config.processing.clone())
            .response_writer(gateway.clone())
            .build()?
            .start();

        // subscribes behind the processor, so it only sees processed records
        let exporter = if config.node.export_records {
            let director = ExporterDirector::builder(Arc::clone(&dispatcher))
                .config(&config.processing)
                .exporter(LoggingExporter::new("log"))
                .build()?;
            Some(director.start())
        } else {
            None
        };

        let messaging = Arc::new(MessagingService::new(config.messaging.clone())?);
        messaging.start().await?;
        gateway.register(&messaging);
        info!(address = %messaging.address(), "Node started");

        Ok(Self {
            config,
            dispatcher,
            processor,
            exporter,
            messaging,
            gateway,
        })
    }

    pub fn address(&self) -> Address {
        self.messaging.address()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn processor(&self) -> &StreamProcessorHandle {
        &self.processor
    }

    pub fn messaging(&self) -> &Arc<MessagingService> {
        &self.messaging
    }

    pub fn gateway(&self) -> &Arc<CommandGateway> {
        &self.gateway
    }

    /// Ping every configured peer, retrying with backoff. Returns the peers
    /// that answered.
    pub async fn ping_peers(&self) -> Vec<Address> {
        let mut reachable = Vec::new();
        for peer in &self.config.node.peers {
            let address: Address = match peer.parse() {
                Ok(address) => address,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Skipping invalid peer address");
                    continue;
                }
            };

            let result = (|| self.messaging.request(&address, PING_SUBJECT, Bytes::new()))
                .retry(connection_backoff())
                .when(|e: &MessagingError| !matches!(e, MessagingError::NotRunning))
                .notify(|e: &MessagingError, delay: Duration| {
                    warn!(peer = %address, error = %e, ?delay, "Peer not reachable, retrying");
                })
                .await;

            match result {
                Ok(reply) => {
                    info!(peer = %address, advertised = %String::from_utf8_lossy(&reply), "Peer reachable");
                    reachable.push(address);
                }
                Err(e) => {
                    warn!(peer = %address, error = %e, "Giving up on peer");
                }
            }
        }
        reachable
    }

    /// Stop in reverse start order. The exporter closes before the
    /// processor in front of it.
    pub async fn shutdown(self) -> Result<()> {
        info!(address = %self.messaging.address(), "Shutting down node");

        self.messaging.stop().await;
        if let Some(exporter) = self.exporter {
            exporter.close().await?;
        }
        let result = self.processor.close().await;
        self.dispatcher.close().await;

        result?;
        info!("Node stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
