//! Log dispatcher.
//!
//! One publisher path appends frames into a [`LogBuffer`]; N subscribers read
//! them back in position order. The publisher is bounded by a limit derived
//! from subscriber progress plus a window, so unread backlog never exceeds
//! the window and partitions are only reused once every subscriber has left
//! them.
//!
//! Two delivery modes:
//! - [`DispatcherMode::PubSub`]: every subscriber reads every frame as soon
//!   as it is published; the limit follows the slowest subscriber.
//! - [`DispatcherMode::Pipeline`]: subscriber `i` reads only what subscriber
//!   `i - 1` has already passed; subscriber 0 follows the publisher.

mod appender;
mod claim;
mod conductor;
pub mod frame;
mod log_buffer;
pub mod position;
mod subscription;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use claim::ClaimedFragment;
pub use log_buffer::{LogBuffer, LogBufferPartition};
pub use subscription::{Fragment, FragmentHandler, PollAction, Subscription};

use appender::RESULT_PARTITION_FILLED;
use conductor::ConductorCommand;
use frame::{aligned_framed_length, FRAME_ALIGNMENT, HEADER_LENGTH};
use position::{partition_id, partition_offset, position, AtomicPosition};
use subscription::SubscriptionState;

/// Result type for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatcherError>;

/// Errors that can occur during dispatcher operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("Message length of {length} is larger than max frame length of {max_frame_length}")]
    FrameTooLarge {
        length: usize,
        max_frame_length: usize,
    },

    #[error("Cannot close subscriptions out of order when in pipelining mode: '{name}' is subscriber {subscriber_id} of {count}")]
    OutOfOrderClose {
        name: String,
        subscriber_id: usize,
        count: usize,
    },

    #[error("Subscription '{0}' is not open")]
    SubscriptionNotFound(String),

    #[error("Dispatcher '{0}' is closed")]
    Closed(String),

    #[error("Timed out waiting for dispatcher '{0}' conductor")]
    Timeout(String),

    #[error("Invalid dispatcher configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Delivery mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherMode {
    #[default]
    PubSub,
    Pipeline,
}

impl DispatcherMode {
    /// Wire value used by older tooling: 1 = pub/sub, 2 = pipeline.
    pub fn code(&self) -> u8 {
        match self {
            DispatcherMode::PubSub => 1,
            DispatcherMode::Pipeline => 2,
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Name used in logs.
    pub name: String,
    /// Bytes per partition. Must be a multiple of 8.
    pub partition_size: usize,
    /// Physical partitions in the ring.
    pub partition_count: usize,
    /// Bytes the publisher may run ahead of the slowest subscriber.
    /// Defaults to a quarter of the partition size.
    pub log_window_length: Option<usize>,
    /// Delivery mode.
    pub mode: DispatcherMode,
    /// Id of the first partition.
    pub initial_partition_id: i32,
    /// Conductor housekeeping interval.
    pub conductor_interval_ms: u64,
    /// Bound on waiting for the conductor to process a close.
    pub close_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "log".to_string(),
            partition_size: 4 * 1024 * 1024,
            partition_count: 3,
            log_window_length: None,
            mode: DispatcherMode::PubSub,
            initial_partition_id: 0,
            conductor_interval_ms: 10,
            close_timeout_ms: 5_000,
        }
    }
}

impl DispatcherConfig {
    pub fn window_length(&self) -> usize {
        self.log_window_length.unwrap_or(self.partition_size / 4)
    }

    /// Largest payload accepted by `offer`/`claim` is one byte less than this.
    pub fn max_frame_length(&self) -> usize {
        self.partition_size / 16
    }

    fn validate(&self) -> Result<()> {
        if self.partition_size == 0 || self.partition_size % FRAME_ALIGNMENT != 0 {
            return Err(DispatcherError::InvalidConfig(format!(
                "partition_size {} must be a non-zero multiple of {}",
                self.partition_size, FRAME_ALIGNMENT
            )));
        }
        if self.partition_size > i32::MAX as usize {
            return Err(DispatcherError::InvalidConfig(format!(
                "partition_size {} does not fit a partition offset",
                self.partition_size
            )));
        }
        if self.partition_count < 2 {
            return Err(DispatcherError::InvalidConfig(
                "partition_count must be at least 2".to_string(),
            ));
        }
        let window = self.window_length();
        let min_window = aligned_framed_length(self.max_frame_length()) + HEADER_LENGTH;
        if window < min_window || window > self.partition_size {
            return Err(DispatcherError::InvalidConfig(format!(
                "log_window_length {} must be between {} and partition_size {}",
                window, min_window, self.partition_size
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Offer results
// ============================================================================

/// Outcome of a non-blocking `offer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Frame published; position just past it.
    Published(i64),
    /// No capacity under the publisher limit. Retry later.
    Backpressure,
    /// The active partition filled up and was rolled. Retry immediately.
    PartitionFilled,
}

impl Offer {
    /// Classic sentinel encoding: the position, `-1` or `-2`.
    pub fn as_raw(&self) -> i64 {
        match self {
            Offer::Published(position) => *position,
            Offer::Backpressure => -1,
            Offer::PartitionFilled => RESULT_PARTITION_FILLED,
        }
    }

    pub fn position(&self) -> Option<i64> {
        match self {
            Offer::Published(position) => Some(*position),
            _ => None,
        }
    }
}

/// Outcome of a non-blocking `claim`.
pub enum Claim<'a> {
    /// Space reserved; position just past the frame once committed.
    Claimed(i64, ClaimedFragment<'a>),
    Backpressure,
    PartitionFilled,
}

// ============================================================================
// Dispatcher
// ============================================================================

pub(crate) struct Shared {
    pub(crate) name: String,
    mode: DispatcherMode,
    pub(crate) log_buffer: LogBuffer,
    window: usize,
    max_frame_length: usize,
    publisher_limit: AtomicPosition,
    publisher_position: AtomicPosition,
    subscriptions: RwLock<Vec<Arc<SubscriptionState>>>,
    /// Next partition id to be cleaned. Also serializes cleaning against
    /// subscription registration.
    clean_watermark: Mutex<i32>,
    pub(crate) conductor_signal: Notify,
}

impl Shared {
    pub(crate) fn subscriber_limit(&self, subscriber_id: usize) -> i64 {
        match self.mode {
            DispatcherMode::PubSub => self.publisher_position.get_volatile(),
            DispatcherMode::Pipeline if subscriber_id == 0 => {
                self.publisher_position.get_volatile()
            }
            DispatcherMode::Pipeline => {
                let subscriptions = self.subscriptions.read();
                subscriptions
                    .get(subscriber_id - 1)
                    .map(|previous| previous.position.get_volatile())
                    .unwrap_or_else(|| self.publisher_position.get_volatile())
            }
        }
    }

    /// Clean consumed partitions and advance the publisher limit.
    pub(crate) fn update_publisher_limit(&self) -> bool {
        let mut watermark = self.clean_watermark.lock();

        let (last_subscriber_position, slowest) = {
            let subscriptions = self.subscriptions.read();
            match subscriptions.last() {
                None => (self.publisher_limit.get() - self.window as i64, None),
                Some(last) => {
                    let last_position = last.position.get_volatile();
                    let slowest = subscriptions
                        .iter()
                        .map(|s| s.position.get_volatile())
                        .min()
                        .unwrap_or(last_position);
                    let limiting = match self.mode {
                        DispatcherMode::PubSub => slowest,
                        DispatcherMode::Pipeline => last_position,
                    };
                    (limiting, Some(slowest))
                }
            }
        };

        if let Some(slowest) = slowest {
            let count = self.log_buffer.partition_count() as i32;
            while *watermark < partition_id(slowest) {
                let consumed = *watermark;
                self.log_buffer
                    .partition(consumed)
                    .clean(consumed + count);
                debug!(
                    dispatcher = %self.name,
                    partition_id = consumed,
                    "Cleaned consumed partition"
                );
                *watermark += 1;
            }
        }

        let partition_size = self.log_buffer.partition_size();
        let mut limit_partition = partition_id(last_subscriber_position);
        let mut limit_offset = partition_offset(last_subscriber_position) as usize + self.window;
        if limit_offset >= partition_size {
            limit_partition += 1;
            limit_offset = self.window;
        }

        let reusable_end = position(
            *watermark + self.log_buffer.partition_count() as i32,
            0,
        );
        let proposed = position(limit_partition, limit_offset as i32).min(reusable_end);
        self.publisher_limit.propose_max_ordered(proposed)
    }

    pub(crate) fn do_close_subscription(&self, state: &Arc<SubscriptionState>) -> Result<()> {
        let mut subscriptions = self.subscriptions.write();
        let index = subscriptions
            .iter()
            .position(|s| Arc::ptr_eq(s, state))
            .ok_or_else(|| DispatcherError::SubscriptionNotFound(state.name.clone()))?;

        if self.mode == DispatcherMode::Pipeline && index != subscriptions.len() - 1 {
            return Err(DispatcherError::OutOfOrderClose {
                name: state.name.clone(),
                subscriber_id: index,
                count: subscriptions.len(),
            });
        }

        subscriptions.remove(index);
        for (id, remaining) in subscriptions.iter().enumerate().skip(index) {
            remaining.id.store(id, Ordering::Release);
        }

        info!(
            dispatcher = %self.name,
            subscription = %state.name,
            remaining = subscriptions.len(),
            "Subscription closed"
        );
        Ok(())
    }

    fn on_append(&self, partition_id: i32, result: i64) -> Offer {
        if result > 0 {
            let new_position = position(partition_id, result as i32);
            self.publisher_position.propose_max_ordered(new_position);
            Offer::Published(new_position)
        } else if result == RESULT_PARTITION_FILLED {
            self.log_buffer.on_active_partition_filled(partition_id);
            // The rest of the partition is padding; let readers skip it.
            self.publisher_position
                .propose_max_ordered(position(partition_id + 1, 0));
            Offer::PartitionFilled
        } else {
            Offer::Backpressure
        }
    }

    fn check_length(&self, length: usize) -> Result<()> {
        if length < self.max_frame_length {
            Ok(())
        } else {
            Err(DispatcherError::FrameTooLarge {
                length,
                max_frame_length: self.max_frame_length,
            })
        }
    }

    /// Active partition id and the position of its tail, if under the limit.
    fn writable_partition(&self) -> Option<i32> {
        let limit = self.publisher_limit.get_volatile();
        let active = self.log_buffer.active_partition_id_volatile();
        let tail = self.log_buffer.partition(active).tail_volatile();
        (position(active, tail) < limit).then_some(active)
    }
}

/// Single-publisher, multi-subscriber log dispatcher.
pub struct Dispatcher {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<ConductorCommand>,
    conductor: Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
}

impl Dispatcher {
    /// Allocate the log buffer and start the conductor task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: DispatcherConfig) -> Result<Self> {
        config.validate()?;

        let log_buffer = LogBuffer::new(
            config.partition_count,
            config.partition_size,
            config.initial_partition_id,
        );
        let window = config.window_length();

        let shared = Arc::new(Shared {
            name: config.name.clone(),
            mode: config.mode,
            log_buffer,
            window,
            max_frame_length: config.max_frame_length(),
            publisher_limit: AtomicPosition::new(position(
                config.initial_partition_id,
                window as i32,
            )),
            publisher_position: AtomicPosition::new(position(config.initial_partition_id, 0)),
            subscriptions: RwLock::new(Vec::new()),
            clean_watermark: Mutex::new(config.initial_partition_id),
            conductor_signal: Notify::new(),
        });

        let (commands, receiver) = mpsc::unbounded_channel();
        let conductor = conductor::spawn(
            Arc::clone(&shared),
            receiver,
            Duration::from_millis(config.conductor_interval_ms.max(1)),
        );

        info!(
            dispatcher = %config.name,
            mode = ?config.mode,
            partition_size = config.partition_size,
            partition_count = config.partition_count,
            window,
            "Dispatcher started"
        );

        Ok(Self {
            shared,
            commands,
            conductor: Mutex::new(Some(conductor)),
            close_timeout: Duration::from_millis(config.close_timeout_ms),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn mode(&self) -> DispatcherMode {
        self.shared.mode
    }

    /// Payloads must be strictly shorter than this.
    pub fn max_frame_length(&self) -> usize {
        self.shared.max_frame_length
    }

    pub fn publisher_position(&self) -> i64 {
        self.shared.publisher_position.get_volatile()
    }

    pub fn publisher_limit(&self) -> i64 {
        self.shared.publisher_limit.get_volatile()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.read().len()
    }

    /// Append `payload` as one frame without blocking.
    ///
    /// A payload at or above the max frame length is a caller error, never
    /// backpressure.
    pub fn offer(&self, payload: &[u8], stream_id: i32) -> Result<Offer> {
        self.shared.check_length(payload.len())?;

        let Some(active) = self.shared.writable_partition() else {
            return Ok(Offer::Backpressure);
        };
        let result = appender::append_frame(&self.shared.log_buffer, active, payload, stream_id);
        Ok(self.shared.on_append(active, result))
    }

    /// Reserve a frame of `length` payload bytes for zero-copy filling.
    ///
    /// The frame stays invisible to subscribers until the returned fragment
    /// is committed.
    pub fn claim(&self, length: usize, stream_id: i32) -> Result<Claim<'_>> {
        self.shared.check_length(length)?;

        let Some(active) = self.shared.writable_partition() else {
            return Ok(Claim::Backpressure);
        };
        match appender::claim(&self.shared.log_buffer, active, length, stream_id) {
            Ok((new_offset, fragment)) => match self.shared.on_append(active, new_offset) {
                Offer::Published(position) => Ok(Claim::Claimed(position, fragment)),
                _ => Ok(Claim::Backpressure),
            },
            Err(result) => match self.shared.on_append(active, result) {
                Offer::PartitionFilled => Ok(Claim::PartitionFilled),
                _ => Ok(Claim::Backpressure),
            },
        }
    }

    /// Register a new subscriber at the end of the subscriber array.
    ///
    /// The subscriber starts at the oldest frame still retained.
    pub fn open_subscription(&self, name: impl Into<String>) -> Subscription {
        let name = name.into();
        let watermark = self.shared.clean_watermark.lock();
        let mut subscriptions = self.shared.subscriptions.write();

        let state = Arc::new(SubscriptionState {
            id: AtomicUsize::new(subscriptions.len()),
            name,
            position: AtomicPosition::new(position(*watermark, 0)),
        });
        subscriptions.push(Arc::clone(&state));

        info!(
            dispatcher = %self.shared.name,
            subscription = %state.name,
            subscriber_id = subscriptions.len() - 1,
            "Subscription opened"
        );

        Subscription {
            shared: Arc::clone(&self.shared),
            state,
        }
    }

    /// Remove a subscriber.
    ///
    /// Runs on the conductor task so it cannot race an in-flight limit
    /// computation. Waits a bounded time for the conductor's answer.
    pub async fn close_subscription(&self, subscription: Subscription) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ConductorCommand::CloseSubscription {
                state: Arc::clone(&subscription.state),
                reply,
            })
            .map_err(|_| DispatcherError::Closed(self.shared.name.clone()))?;

        match tokio::time::timeout(self.close_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatcherError::Closed(self.shared.name.clone())),
            Err(_) => Err(DispatcherError::Timeout(self.shared.name.clone())),
        }
    }

    /// Recompute the publisher limit now instead of waiting for the conductor.
    ///
    /// Returns `true` if the limit moved.
    pub fn update_publisher_limit(&self) -> bool {
        self.shared.update_publisher_limit()
    }

    /// Stop the conductor. Pending offers keep working; limits stop moving.
    pub async fn close(&self) {
        let _ = self.commands.send(ConductorCommand::Shutdown);
        let conductor = self.conductor.lock().take();
        if let Some(conductor) = conductor {
            if let Err(e) = conductor.await {
                warn!(dispatcher = %self.shared.name, error = %e, "Conductor task failed");
            }
        }
        info!(dispatcher = %self.shared.name, "Dispatcher closed");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(conductor) = self.conductor.get_mut().take() {
            conductor.abort();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.shared.name)
            .field("mode", &self.shared.mode)
            .field("publisher_position", &self.publisher_position())
            .field("publisher_limit", &self.publisher_limit())
            .finish()
    }
}
