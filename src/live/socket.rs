//! Per-connection view state.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::error::LiveError;
use crate::live::event::Event;
use crate::live::session::Session;

/// View-model data assigned by handlers.
pub type Assigns = Map<String, JsonValue>;

/// Turn a JSON object into assigns. Anything but an object is empty.
pub fn into_assigns(value: JsonValue) -> Assigns {
    match value {
        JsonValue::Object(map) => map,
        _ => Assigns::new(),
    }
}

/// State for one view on one connection attempt.
///
/// The stateless pass and the duplex pass each build their own socket; only
/// the duplex one owns an outbound queue. Handlers may change the session
/// through [`Socket::session_mut`]; the stateless pass saves it afterwards,
/// the duplex pass never writes it back.
pub struct Socket {
    id: Uuid,
    session: RwLock<Session>,
    assigns: Assigns,
    latest_render: Option<String>,
    connected: bool,
    outbound: Option<async_channel::Sender<Event>>,
}

impl Socket {
    /// Socket for the first, unconnected render.
    pub fn new(session: Session) -> Self {
        Self {
            id: Uuid::new_v4(),
            session: RwLock::new(session),
            assigns: Assigns::new(),
            latest_render: None,
            connected: false,
            outbound: None,
        }
    }

    /// Socket for a duplex connection, writing to `outbound`.
    pub fn connected(session: Session, outbound: async_channel::Sender<Event>) -> Self {
        Self {
            connected: true,
            outbound: Some(outbound),
            ..Self::new(session)
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session(&self) -> RwLockReadGuard<'_, Session> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_mut(&self) -> RwLockWriteGuard<'_, Session> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn assigns(&self) -> &Assigns {
        &self.assigns
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn latest_render(&self) -> Option<&str> {
        self.latest_render.as_deref()
    }

    /// Merge handler output into the assigns, key by key.
    pub fn assign(&mut self, data: Assigns) {
        for (key, value) in data {
            self.assigns.insert(key, value);
        }
    }

    pub fn update_render(&mut self, render: String) {
        self.latest_render = Some(render);
    }

    /// Queue an application event without waiting. Fails on the unconnected
    /// socket and when the outbound queue is full or gone.
    pub fn push(&self, t: &str, data: JsonValue) -> Result<(), LiveError> {
        let outbound = self.outbound.as_ref().ok_or(LiveError::NotConnected)?;
        outbound
            .try_send(Event::new(t).with_data(data))
            .map_err(|e| match e {
                async_channel::TrySendError::Full(_) => LiveError::QueueFull,
                async_channel::TrySendError::Closed(_) => LiveError::QueueClosed,
            })
    }

    /// Queue an outbound event, waiting for room in the queue.
    pub(crate) async fn send(&self, event: Event) -> Result<(), LiveError> {
        let outbound = self.outbound.as_ref().ok_or(LiveError::NotConnected)?;
        outbound
            .send(event)
            .await
            .map_err(|_| LiveError::QueueClosed)
    }
}
