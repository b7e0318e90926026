use crate::RealtimeEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Events buffered per connection before new ones are dropped for it.
pub const CONNECTION_BUFFER: usize = 64;

type Connections = HashMap<Uuid, Vec<(u64, mpsc::Sender<String>)>>;

/// Live client connections keyed by user. Constructed once per process and
/// cloned into every publisher; clones share the same connection table.
///
/// Delivery is best-effort: nothing is queued for users without a live
/// connection, a connection whose buffer is full misses the event, and
/// closed connections are dropped on the next publish.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    connections: Mutex<Connections>,
    next_id: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Connections> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One client connection. Dropping it unregisters the connection.
pub struct Subscription {
    user_id: Uuid,
    connection_id: u64,
    receiver: mpsc::Receiver<String>,
    registry: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for `user_id` and queues the `connected`
    /// welcome event on it.
    pub fn register(&self, user_id: Uuid) -> Subscription {
        let (sender, receiver) = mpsc::channel(CONNECTION_BUFFER);
        let connection_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let welcome = RealtimeEvent::Connected {
            message: "Connected to Mycelix Mail".to_string(),
        };
        if let Ok(payload) = serde_json::to_string(&welcome) {
            let _ = sender.try_send(payload);
        }

        self.inner
            .lock()
            .entry(user_id)
            .or_default()
            .push((connection_id, sender));
        tracing::debug!(%user_id, connection_id, "realtime client connected");

        Subscription {
            user_id,
            connection_id,
            receiver,
            registry: Arc::clone(&self.inner),
        }
    }

    /// Sends `event` to every live connection of `user_id` and returns how
    /// many accepted it.
    pub fn publish(&self, user_id: Uuid, event: &RealtimeEvent) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    %user_id,
                    event = event.name(),
                    "failed to encode realtime event: {err}"
                );
                return 0;
            }
        };

        let mut connections = self.inner.lock();
        let Some(senders) = connections.get_mut(&user_id) else {
            return 0;
        };

        let mut delivered = 0;
        senders.retain(|(connection_id, sender)| match sender.try_send(payload.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::debug!(%user_id, connection_id, "realtime buffer full, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if senders.is_empty() {
            connections.remove(&user_id);
        }

        tracing::trace!(%user_id, event = event.name(), delivered, "published realtime event");
        delivered
    }

    pub fn connection_count(&self, user_id: Uuid) -> usize {
        self.inner.lock().get(&user_id).map_or(0, Vec::len)
    }
}

impl Subscription {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut connections = self.registry.lock();
        if let Some(senders) = connections.get_mut(&self.user_id) {
            senders.retain(|(id, _)| *id != self.connection_id);
            if senders.is_empty() {
                connections.remove(&self.user_id);
            }
        }
        tracing::debug!(
            user_id = %self.user_id,
            connection_id = self.connection_id,
            "realtime client disconnected"
        );
    }
}
