//! Registry of live sockets with an open duplex connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::error::LiveError;
use crate::live::event::Event;

/// A registered socket's outbound side.
#[derive(Clone)]
pub struct RegisteredSocket {
    pub id: Uuid,
    outbound: async_channel::Sender<Event>,
}

/// Registry for all connected sockets of one engine.
#[derive(Clone, Default)]
pub struct SocketRegistry {
    sockets: Arc<Mutex<HashMap<Uuid, RegisteredSocket>>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket. The entry lives as long as the returned guard.
    #[must_use = "the socket is deregistered when the registration is dropped"]
    pub fn register(&self, id: Uuid, outbound: async_channel::Sender<Event>) -> Registration {
        self.lock().insert(
            id,
            RegisteredSocket {
                id,
                outbound,
            },
        );
        tracing::debug!(socket = %id, "socket registered");
        Registration {
            registry: self.clone(),
            id,
        }
    }

    fn unregister(&self, id: &Uuid) {
        if self.lock().remove(id).is_some() {
            tracing::debug!(socket = %id, "socket deregistered");
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<RegisteredSocket> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Queue an event on a registered socket's outbound queue.
    pub fn send(&self, id: &Uuid, event: Event) -> Result<(), LiveError> {
        let outbound = self
            .lock()
            .get(id)
            .map(|socket| socket.outbound.clone())
            .ok_or(LiveError::NotConnected)?;
        outbound.try_send(event).map_err(|e| match e {
            async_channel::TrySendError::Full(_) => LiveError::QueueFull,
            async_channel::TrySendError::Closed(_) => LiveError::QueueClosed,
        })
    }

    // A panic while holding the lock cannot leave the map half-updated.
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, RegisteredSocket>> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a socket registered; deregisters it on drop, including unwinding.
pub struct Registration {
    registry: SocketRegistry,
    id: Uuid,
}

impl Registration {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}
