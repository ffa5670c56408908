//! Fan-out of snapshots to connected viewers.
//!
//! The hub holds a registry of channels it does not own. Delivery never
//! waits: a channel that is closed or whose queue is full is dropped from the
//! registry and the rest keep receiving. Callers that need per-channel
//! ordering across publishes must not publish concurrently; the coordinator
//! funnels every publish through one gate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::events::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("viewer channel closed")]
    Closed,
    #[error("viewer channel queue full")]
    Full,
}

/// One observer connection as seen by the hub.
pub trait ViewerChannel: Send + Sync {
    /// Queue a serialized message without waiting.
    fn send(&self, message: Arc<str>) -> Result<(), DeliveryError>;
}

impl ViewerChannel for mpsc::Sender<Arc<str>> {
    fn send(&self, message: Arc<str>) -> Result<(), DeliveryError> {
        self.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

#[derive(Default)]
pub struct BroadcastHub {
    channels: Mutex<HashMap<ChannelId, Arc<dyn ViewerChannel>>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `catch_up` to `channel` alone, then add it to the registry.
    ///
    /// A channel that cannot take its catch-up messages is never registered.
    pub fn register(
        &self,
        channel: Arc<dyn ViewerChannel>,
        catch_up: &[ServerMessage],
    ) -> Result<ChannelId, DeliveryError> {
        for message in catch_up {
            channel.send(serialize(message))?;
        }
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let total = {
            let mut channels = self.lock();
            channels.insert(id, channel);
            channels.len()
        };
        info!(channel = %id, viewers = total, "viewer registered");
        Ok(id)
    }

    /// Forget a channel. Unknown ids are ignored.
    pub fn unregister(&self, id: ChannelId) {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            info!(channel = %id, "viewer unregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize once and offer the message to every registered channel.
    /// Returns how many channels accepted it.
    pub fn publish(&self, message: &ServerMessage) -> usize {
        let payload = serialize(message);
        let targets: Vec<(ChannelId, Arc<dyn ViewerChannel>)> = self
            .lock()
            .iter()
            .map(|(id, channel)| (*id, Arc::clone(channel)))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, channel) in targets {
            match channel.send(Arc::clone(&payload)) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(channel = %id, kind = message.kind(), error = %err, "dropping viewer");
                    failed.push(id);
                }
            }
        }
        if !failed.is_empty() {
            let mut channels = self.lock();
            for id in &failed {
                channels.remove(id);
            }
        }
        debug!(kind = message.kind(), delivered, dropped = failed.len(), "published");
        delivered
    }

    // Nothing panics while holding the registry lock, so a poisoned lock
    // still guards a consistent map.
    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelId, Arc<dyn ViewerChannel>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn serialize(message: &ServerMessage) -> Arc<str> {
    match serde_json::to_string(message) {
        Ok(text) => text.into(),
        // Snapshots contain only strings, integers and booleans.
        Err(err) => {
            warn!(kind = message.kind(), error = %err, "failed to serialize snapshot");
            Arc::from("{}")
        }
    }
}
