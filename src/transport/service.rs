use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::{BoxedStream, Channel};
use super::handlers::{HandlerRegistry, MessageHandler};
use super::handshake::{client_handshake, preamble, server_handshake};
use super::pool::ChannelPool;
use super::stage::FramePipeline;
use super::tls::TlsContext;
use super::{
    Address, HandlerResult, MessagingConfig, MessagingError, ProtocolRequest, Result,
};

const CLOSED_REASON: &str = "MessagingService has been closed.";

/// Everything needed to turn a socket into a channel, on either side.
#[derive(Clone)]
struct Connector {
    preamble: i32,
    handlers: Arc<HandlerRegistry>,
    pipeline: Arc<FramePipeline>,
    tls: Option<TlsContext>,
    connect_timeout: Duration,
    max_frame_length: usize,
    /// Inbound and transient channels, closed on stop.
    connections: Arc<DashMap<u64, Arc<Channel>>>,
}

impl Connector {
    fn track(&self, channel: &Arc<Channel>) {
        self.connections.retain(|_, channel| !channel.is_closed());
        self.connections.insert(channel.id(), Arc::clone(channel));
    }

    async fn connect(&self, address: &Address) -> Result<Arc<Channel>> {
        let connect_failed = |reason: String| MessagingError::ConnectFailed {
            address: address.clone(),
            reason,
        };

        let socket_addr = address
            .resolve()
            .await
            .map_err(|e| connect_failed(e.to_string()))?;
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(socket_addr))
            .await
            .map_err(|_| connect_failed(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| connect_failed(e.to_string()))?;
        stream.set_nodelay(true)?;

        let mut stream: BoxedStream = match &self.tls {
            Some(tls) => tls.connect(address, stream).await?,
            None => Box::new(stream),
        };
        let version = tokio::time::timeout(
            self.connect_timeout,
            client_handshake(&mut stream, self.preamble),
        )
        .await
        .map_err(|_| MessagingError::HandshakeFailed(format!("no handshake from {address}")))??;

        debug!(address = %address, version = version.version(), "Connected");
        Ok(Channel::spawn(
            stream,
            version,
            Arc::clone(&self.pipeline),
            Arc::clone(&self.handlers),
            address.clone(),
            self.max_frame_length,
        ))
    }

    async fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut stream: BoxedStream = match &self.tls {
            Some(tls) => tls.accept(stream).await?,
            None => Box::new(stream),
        };
        let version = tokio::time::timeout(
            self.connect_timeout,
            server_handshake(&mut stream, self.preamble),
        )
        .await
        .map_err(|_| MessagingError::HandshakeFailed(format!("no handshake from {peer}")))??;

        let channel = Channel::spawn(
            stream,
            version,
            Arc::clone(&self.pipeline),
            Arc::clone(&self.handlers),
            Address::from(peer),
            self.max_frame_length,
        );
        debug!(peer = %peer, channel = channel.id(), version = version.version(), "Accepted connection");
        self.track(&channel);
        Ok(())
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let connector = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = connector.accept(stream, peer).await {
                            debug!(peer = %peer, error = %e, "Inbound connection rejected");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

/// A cluster member's messaging endpoint.
///
/// Serves registered handlers on the configured interfaces and sends
/// requests to other members.
pub struct MessagingService {
    config: MessagingConfig,
    address: RwLock<Address>,
    connector: Connector,
    pool: ChannelPool,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    next_local_id: AtomicI64,
}

impl MessagingService {
    pub fn new(config: MessagingConfig) -> Result<Self> {
        let tls = TlsContext::from_config(&config.tls)?;
        let connector = Connector {
            preamble: preamble(&config.cluster_id),
            handlers: Arc::new(HandlerRegistry::default()),
            pipeline: Arc::new(FramePipeline::for_compression(
                config.compression,
                config.max_frame_length,
            )),
            tls,
            connect_timeout: config.connect_timeout(),
            max_frame_length: config.max_frame_length,
            connections: Arc::new(DashMap::new()),
        };
        Ok(Self {
            address: RwLock::new(config.advertised_address()),
            pool: ChannelPool::new(config.connection_pool_size),
            connector,
            listeners: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            next_local_id: AtomicI64::new(1),
            config,
        })
    }

    /// Advertised address. Carries the bound port once started.
    pub fn address(&self) -> Address {
        self.address.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(MessagingError::NotRunning)
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bind every interface and start accepting connections.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let advertised = self.config.advertised_address();
        let interfaces = if self.config.interfaces.is_empty() {
            vec![advertised.host().to_string()]
        } else {
            self.config.interfaces.clone()
        };

        // With port 0 the first bind picks the port the others reuse.
        let mut port = self.config.port;
        let mut listeners = Vec::with_capacity(interfaces.len());
        for interface in &interfaces {
            let listener = TcpListener::bind((interface.as_str(), port)).await?;
            let local = listener.local_addr()?;
            port = local.port();
            info!(address = %local, "TCP server listening for connections");
            listeners.push(listener);
        }

        *self.address.write() = advertised.with_port(port);
        let handles = listeners
            .into_iter()
            .map(|listener| tokio::spawn(self.connector.clone().accept_loop(listener)))
            .collect();
        *self.listeners.lock() = handles;
        self.running.store(true, Ordering::Release);
        info!(address = %self.address(), cluster_id = %self.config.cluster_id, "Started messaging service");
        Ok(())
    }

    /// Stop accepting, close every connection and fail open requests.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for handle in self.listeners.lock().drain(..) {
            handle.abort();
        }
        self.pool.close_all(CLOSED_REASON).await;

        let connections: Vec<Arc<Channel>> = self
            .connector
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.connector.connections.clear();
        for channel in connections {
            channel.close(CLOSED_REASON);
        }

        let quiet = Duration::from_millis(
            self.config
                .shutdown_quiet_period_ms
                .min(self.config.shutdown_timeout_ms),
        );
        tokio::time::sleep(quiet).await;
        info!(address = %self.address(), "Stopped messaging service");
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send without waiting for a reply, over the pooled connection.
    pub async fn send_async(
        &self,
        address: &Address,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.ensure_running()?;
        let payload = payload.into();
        let sender = self.address();

        if *address == sender {
            let request = self.local_request(sender, subject, payload);
            let handlers = Arc::clone(&self.connector.handlers);
            tokio::spawn(async move {
                handlers.dispatch(request).await;
            });
            return Ok(());
        }

        let channel = self
            .pool
            .get_or_connect(address, subject, || self.connector.connect(address))
            .await?;
        let result = channel.send_async(&sender, subject, payload);
        if let Err(e) = &result {
            self.discard(address, &channel, e).await;
        }
        result
    }

    /// Send a request and wait for the reply.
    ///
    /// `keep_alive` sends reuse a pooled channel; other sends open a
    /// transient connection that is closed afterwards. `timeout` defaults to
    /// the configured request timeout.
    pub async fn send_and_receive(
        &self,
        address: &Address,
        subject: &str,
        payload: impl Into<Bytes>,
        keep_alive: bool,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        self.ensure_running()?;
        let payload = payload.into();
        let timeout = timeout.unwrap_or_else(|| self.config.request_timeout());
        let sender = self.address();

        if *address == sender {
            return self.send_local(sender, subject, payload, timeout).await;
        }

        if keep_alive {
            let channel = self
                .pool
                .get_or_connect(address, subject, || self.connector.connect(address))
                .await?;
            let result = channel
                .send_and_receive(&sender, subject, payload, timeout)
                .await;
            if let Err(e) = &result {
                self.discard(address, &channel, e).await;
            }
            result
        } else {
            let channel = self.connector.connect(address).await?;
            self.connector.track(&channel);
            let result = channel
                .send_and_receive(&sender, subject, payload, timeout)
                .await;
            channel.close("transient request finished");
            self.connector.connections.remove(&channel.id());
            result
        }
    }

    /// Pooled request with the default timeout.
    pub async fn request(
        &self,
        address: &Address,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Bytes> {
        self.send_and_receive(address, subject, payload, true, None)
            .await
    }

    /// Close and evict a pooled channel after a failed send. Replies the
    /// remote handler produced leave the channel alone.
    async fn discard(&self, address: &Address, channel: &Channel, error: &MessagingError) {
        if error.is_protocol_level() {
            return;
        }
        match error {
            MessagingError::Timeout { .. } => {
                warn!(address = %address, channel = channel.id(), "Request timed out, closing channel");
            }
            _ => debug!(address = %address, channel = channel.id(), error = %error, "Closing channel after send failure"),
        }
        channel.close(&error.to_string());
        self.pool.evict(address, channel).await;
    }

    fn local_request(&self, sender: Address, subject: &str, payload: Bytes) -> ProtocolRequest {
        ProtocolRequest {
            id: self.next_local_id.fetch_add(1, Ordering::Relaxed),
            sender,
            subject: subject.to_string(),
            payload,
        }
    }

    /// Requests to ourselves go straight to the handler.
    async fn send_local(
        &self,
        sender: Address,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes> {
        let request = self.local_request(sender.clone(), subject, payload);
        let handlers = &self.connector.handlers;
        let reply = tokio::time::timeout(timeout, handlers.dispatch(request))
            .await
            .map_err(|_| MessagingError::Timeout {
                address: sender,
                subject: subject.to_string(),
                timeout,
            })?;
        match reply {
            Some(reply) => reply.into_result(subject),
            // A fire-and-forget handler took the message and has nothing to say.
            None => Ok(Bytes::new()),
        }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Register a handler that consumes messages without replying.
    pub fn register_handler<F>(&self, subject: impl Into<String>, handler: F)
    where
        F: Fn(Address, Bytes) + Send + Sync + 'static,
    {
        self.connector
            .handlers
            .register(subject, MessageHandler::fire_and_forget(handler));
    }

    /// Register a blocking handler whose result is the reply.
    pub fn register_sync_handler<F>(&self, subject: impl Into<String>, handler: F)
    where
        F: Fn(Address, Bytes) -> HandlerResult + Send + Sync + 'static,
    {
        self.connector
            .handlers
            .register(subject, MessageHandler::sync(handler));
    }

    /// Register a handler returning a future of the reply.
    pub fn register_async_handler<F, Fut>(&self, subject: impl Into<String>, handler: F)
    where
        F: Fn(Address, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.connector
            .handlers
            .register(subject, MessageHandler::future(handler));
    }

    pub fn unregister_handler(&self, subject: &str) {
        self.connector.handlers.unregister(subject);
    }

    #[cfg(test)]
    pub(crate) async fn pooled_channel(&self, address: &Address, subject: &str) -> Option<u64> {
        self.pool.channel_id(address, subject).await
    }

    #[cfg(test)]
    pub(crate) fn open_connections(&self) -> usize {
        self.connector
            .connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }
}
