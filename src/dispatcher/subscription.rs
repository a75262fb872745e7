//! Subscriber cursors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::frame::{align, FRAME_ALIGNMENT, HEADER_LENGTH, TYPE_PADDING};
use super::position::{partition_id, partition_offset, position, AtomicPosition};
use super::Shared;

/// What a fragment handler did with a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    /// Fragment handled, move past it.
    Consume,
    /// Leave the fragment for the next poll and stop.
    Postpone,
}

/// A committed message frame as seen by a subscriber.
#[derive(Debug, Clone, Copy)]
pub struct Fragment<'a> {
    /// Position just past the frame; the value `offer` returned for it.
    pub position: i64,
    pub stream_id: i32,
    pub payload: &'a [u8],
}

/// Callback for [`Subscription::poll`].
pub trait FragmentHandler {
    fn on_fragment(&mut self, fragment: &Fragment<'_>) -> PollAction;
}

impl<F> FragmentHandler for F
where
    F: FnMut(&Fragment<'_>) -> PollAction,
{
    fn on_fragment(&mut self, fragment: &Fragment<'_>) -> PollAction {
        self(fragment)
    }
}

/// Shared part of a subscription, referenced from the dispatcher's
/// subscriber array.
#[derive(Debug)]
pub(crate) struct SubscriptionState {
    pub(crate) id: AtomicUsize,
    pub(crate) name: String,
    pub(crate) position: AtomicPosition,
}

/// A named reader cursor.
pub struct Subscription {
    pub(crate) shared: Arc<Shared>,
    pub(crate) state: Arc<SubscriptionState>,
}

impl Subscription {
    /// Dense subscriber id, `0..N-1` in registration order.
    pub fn id(&self) -> usize {
        self.state.id.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Position of the next frame this subscriber will read.
    pub fn position(&self) -> i64 {
        self.state.position.get_volatile()
    }

    /// Upper bound this subscriber may currently read up to.
    pub fn limit(&self) -> i64 {
        self.shared.subscriber_limit(self.id())
    }

    /// Deliver up to `max_fragments` committed message frames to `handler`.
    ///
    /// Padding frames are skipped. Stops early at an uncommitted frame, at
    /// the subscriber limit, or when the handler postpones. Returns the
    /// number of fragments consumed.
    pub fn poll<H: FragmentHandler>(&mut self, handler: &mut H, max_fragments: usize) -> usize {
        let limit = self.limit();
        let log_buffer = &self.shared.log_buffer;
        let partition_size = log_buffer.partition_size();

        let mut current = self.state.position.get();
        let mut consumed = 0;

        while consumed < max_fragments && current < limit {
            let pid = partition_id(current);
            let offset = partition_offset(current) as usize;
            let partition = log_buffer.partition(pid);
            if partition.partition_id() != pid {
                break;
            }

            let length = partition.frame_length_volatile(offset);
            if length <= 0 {
                break;
            }
            let length = length as usize;
            let next_offset = offset + align(length, FRAME_ALIGNMENT);
            let next = if next_offset >= partition_size {
                position(pid + 1, 0)
            } else {
                position(pid, next_offset as i32)
            };

            if partition.frame_type(offset) == TYPE_PADDING {
                current = next;
                self.state.position.set_ordered(current);
                continue;
            }

            let fragment = Fragment {
                position: position(pid, next_offset as i32),
                stream_id: partition.stream_id(offset),
                payload: partition.bytes(offset + HEADER_LENGTH, length - HEADER_LENGTH),
            };

            match handler.on_fragment(&fragment) {
                PollAction::Consume => {
                    current = next;
                    self.state.position.set_ordered(current);
                    consumed += 1;
                }
                PollAction::Postpone => break,
            }
        }

        if consumed > 0 {
            self.shared.conductor_signal.notify_one();
        }
        consumed
    }

    /// True if the subscriber is behind its limit. The frame there may still
    /// be uncommitted.
    pub fn has_available(&self) -> bool {
        self.position() < self.limit()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("name", &self.state.name)
            .field("position", &self.position())
            .finish()
    }
}
