//! Keep-alive channels, a fixed number of slots per peer.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::channel::Channel;
use super::{Address, Result};

type Slots = Arc<Vec<Mutex<Option<Arc<Channel>>>>>;

pub(crate) struct ChannelPool {
    size: usize,
    peers: DashMap<Address, Slots>,
}

impl ChannelPool {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            peers: DashMap::new(),
        }
    }

    /// Requests with the same subject always share a slot.
    fn slot(&self, subject: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        subject.hash(&mut hasher);
        (hasher.finish() % self.size as u64) as usize
    }

    fn slots(&self, address: &Address) -> Slots {
        self.peers
            .entry(address.clone())
            .or_insert_with(|| Arc::new((0..self.size).map(|_| Mutex::new(None)).collect()))
            .value()
            .clone()
    }

    /// The open channel in the subject's slot, connecting one if the slot is
    /// empty or holds a closed channel. Concurrent callers for one slot wait
    /// for a single connect.
    pub(crate) async fn get_or_connect<F, Fut>(
        &self,
        address: &Address,
        subject: &str,
        connect: F,
    ) -> Result<Arc<Channel>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Channel>>>,
    {
        let slots = self.slots(address);
        let mut slot = slots[self.slot(subject)].lock().await;
        if let Some(channel) = slot.as_ref().filter(|channel| !channel.is_closed()) {
            return Ok(Arc::clone(channel));
        }

        let channel = connect().await?;
        debug!(address = %address, channel = channel.id(), version = channel.version().version(), "Pooled new channel");
        *slot = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Drop `channel` from whatever slot holds it.
    pub(crate) async fn evict(&self, address: &Address, channel: &Channel) {
        let Some(slots) = self.peers.get(address).map(|slots| Arc::clone(slots.value())) else {
            return;
        };
        for slot in slots.iter() {
            let mut slot = slot.lock().await;
            if slot.as_ref().is_some_and(|pooled| pooled.id() == channel.id()) {
                debug!(address = %address, channel = channel.id(), "Evicted channel from pool");
                *slot = None;
            }
        }
    }

    /// Close and forget every pooled channel.
    pub(crate) async fn close_all(&self, reason: &str) {
        let peers: Vec<Slots> = self
            .peers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.peers.clear();
        for slots in peers {
            for slot in slots.iter() {
                if let Some(channel) = slot.lock().await.take() {
                    channel.close(reason);
                }
            }
        }
    }

    /// Id of the channel currently in the subject's slot.
    pub(crate) async fn channel_id(&self, address: &Address, subject: &str) -> Option<u64> {
        let slots = self.peers.get(address).map(|slots| Arc::clone(slots.value()))?;
        let slot = slots[self.slot(subject)].lock().await;
        slot.as_ref().map(|channel| channel.id())
    }
}
