//! Cluster messaging transport.
//!
//! Peer-to-peer request/reply messaging over TCP (optionally TLS). Every
//! connection starts with a version handshake:
//!
//! ```text
//! CONNECTING -> TLS (if enabled) -> HANDSHAKE -> PROTOCOL ACTIVE -> OPEN -> CLOSED
//! ```
//!
//! The handshake exchanges a 4 byte preamble derived from the cluster id and a
//! 2 byte protocol version. A preamble mismatch closes the connection. After
//! the handshake every frame runs through a static pipeline of stages
//! (compression) before the versioned protocol codec.
//!
//! Sends to the local address never touch the network. Keep-alive sends use
//! a bounded per-peer [`ChannelPool`](pool::ChannelPool); other sends open a
//! transient connection and close it once the reply arrives. A timed-out
//! channel is closed and evicted, never reused.

mod address;
mod channel;
mod handlers;
mod handshake;
mod pool;
mod protocol;
mod service;
mod stage;
mod tls;

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub use address::Address;
pub use handlers::{HandlerError, HandlerResult};
pub use handshake::preamble;
pub use protocol::{ProtocolMessage, ProtocolReply, ProtocolRequest, ProtocolVersion, ReplyStatus};
pub use service::MessagingService;
pub use stage::CompressionAlgorithm;

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors surfaced by the messaging transport.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("Request to {address} with subject '{subject}' timed out after {timeout:?}")]
    Timeout {
        address: Address,
        subject: String,
        timeout: Duration,
    },

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed { address: Address, reason: String },

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("No remote message handler registered for subject '{0}'")]
    NoRemoteHandler(String),

    #[error("Remote handler failed: {0}")]
    RemoteHandlerFailure(String),

    #[error("Protocol error: {0}")]
    ProtocolException(String),

    #[error("MessagingService is closed.")]
    NotRunning,

    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl MessagingError {
    /// Errors the remote side answered with. The channel that carried them is
    /// still healthy.
    pub fn is_protocol_level(&self) -> bool {
        matches!(
            self,
            MessagingError::NoRemoteHandler(_)
                | MessagingError::RemoteHandlerFailure(_)
                | MessagingError::ProtocolException(_)
        )
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// TLS settings. Both sides present the same certificate chain, which is
/// also the trust root for outbound connections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// PEM certificate chain.
    pub certificate_chain: Option<PathBuf>,
    /// PEM PKCS#8 private key.
    pub private_key: Option<PathBuf>,
}

/// Messaging transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Cluster identity. Only members with the same id can talk to each other.
    pub cluster_id: String,
    /// Advertised host.
    pub host: String,
    /// Listen port. `0` picks an ephemeral port on start.
    pub port: u16,
    /// Interfaces to bind. Empty binds the advertised host only.
    pub interfaces: Vec<String>,
    /// Pooled connections per peer.
    pub connection_pool_size: usize,
    pub compression: CompressionAlgorithm,
    pub tls: TlsConfig,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub shutdown_quiet_period_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Largest frame accepted from a peer.
    pub max_frame_length: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            cluster_id: "keel".to_string(),
            host: "127.0.0.1".to_string(),
            port: 26502,
            interfaces: Vec::new(),
            connection_pool_size: 8,
            compression: CompressionAlgorithm::None,
            tls: TlsConfig::default(),
            connect_timeout_ms: 1_000,
            request_timeout_ms: 5_000,
            shutdown_quiet_period_ms: 20,
            shutdown_timeout_ms: 1_000,
            max_frame_length: 16 * 1024 * 1024,
        }
    }
}

impl MessagingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Address other members reach this node at.
    pub fn advertised_address(&self) -> Address {
        Address::new(self.host.clone(), self.port)
    }
}

#[cfg(test)]
mod tests;
