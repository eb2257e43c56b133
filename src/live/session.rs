//! Session carrier.
//!
//! The live engine keeps its own session map under a reserved key of whatever
//! store identifies the visitor. [`SessionCarrier`] is the seam to that store,
//! [`InMemorySessionStore`] is a cookie-based implementation of it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::http::request::Parts;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LiveConfig;
use crate::error::LiveError;

/// Carrier key under which the live session is stored.
pub const SESSION_KEY: &str = "_ls";

/// A single session value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SessionValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl SessionValue {
    /// Convert a carrier-native value. Nulls, arrays and objects have no
    /// session representation.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(s) => Some(Self::Str(s.clone())),
            JsonValue::Bool(b) => Some(Self::Bool(*b)),
            JsonValue::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for SessionValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for SessionValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for SessionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Only finite floats have a session representation; NaN and the
/// infinities would not survive the stored blob.
impl TryFrom<f64> for SessionValue {
    type Error = LiveError;

    fn try_from(value: f64) -> Result<Self, LiveError> {
        if value.is_finite() {
            Ok(Self::Float(value))
        } else {
            Err(LiveError::session(format!("non-finite float: {}", value)))
        }
    }
}

impl From<bool> for SessionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<u8>> for SessionValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// Per-visitor key/value bag shared by the stateless and duplex passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Session(BTreeMap<String, SessionValue>);

impl Session {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&SessionValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<SessionValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<SessionValue> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SessionValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merge carrier-native entries under their own names. Existing live
    /// entries win, the reserved key is never merged.
    pub fn merge_native<'a, I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (&'a String, &'a JsonValue)>,
    {
        for (key, value) in entries {
            if key == SESSION_KEY || self.0.contains_key(key) {
                continue;
            }
            if let Some(value) = SessionValue::from_json(value) {
                self.0.insert(key.clone(), value);
            }
        }
    }
}

/// Adapter to the store that identifies a visitor across requests.
pub trait SessionCarrier: Send + Sync {
    /// Load the visitor's session. A missing record, or one whose live entry
    /// does not decode as a [`Session`], is a first visit: return an empty
    /// session rather than an error.
    fn load(&self, head: &Parts) -> Result<Session, LiveError>;

    /// Persist the session. The returned header, if any, must be sent as
    /// `Set-Cookie` on the response.
    fn save(&self, head: &Parts, session: &Session) -> Result<Option<HeaderValue>, LiveError>;

    fn destroy(&self, head: &Parts) -> Result<(), LiveError>;
}

/// One visitor's carrier record.
#[derive(Clone)]
struct StoredSession {
    data: HashMap<String, JsonValue>,
    last_accessed: Instant,
}

impl StoredSession {
    fn new() -> Self {
        Self {
            data: HashMap::new(),
            last_accessed: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
    }

    fn is_expired(&self, max_age: Duration) -> bool {
        self.last_accessed.elapsed() > max_age
    }
}

/// Thread-safe in-memory carrier keyed by a session cookie.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, StoredSession>>,
    cookie_name: String,
    max_age: Duration,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::from_config(&LiveConfig::default())
    }
}

impl InMemorySessionStore {
    pub fn new(cookie_name: impl Into<String>, max_age: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            cookie_name: cookie_name.into(),
            max_age,
        }
    }

    pub fn from_config(config: &LiveConfig) -> Self {
        Self::new(config.session_cookie.clone(), config.session_max_age)
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Store an entry next to the live session, the way a host application
    /// would through its own session API.
    pub fn insert_native(&self, session_id: &str, key: &str, value: JsonValue) -> Result<(), LiveError> {
        let mut sessions = self.write()?;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(StoredSession::new)
            .data
            .insert(key.to_string(), value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired records.
    pub fn cleanup(&self) -> Result<(), LiveError> {
        let max_age = self.max_age;
        self.write()?
            .retain(|_, session| !session.is_expired(max_age));
        Ok(())
    }

    /// Run [`cleanup`](Self::cleanup) every `period` until `shutdown` fires.
    pub fn spawn_cleanup(
        store: Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticks.tick() => {
                        if let Err(e) = store.cleanup() {
                            tracing::warn!(error = %e, "session cleanup failed");
                        }
                    }
                }
            }
        })
    }

    fn session_id(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|cookies| extract_session_id(Some(cookies), &self.cookie_name))
    }

    fn cookie(&self, session_id: &str) -> Result<HeaderValue, LiveError> {
        let cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.cookie_name,
            session_id,
            self.max_age.as_secs()
        );
        HeaderValue::from_str(&cookie).map_err(|e| LiveError::session(e.to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, StoredSession>>, LiveError> {
        self.sessions
            .write()
            .map_err(|_| LiveError::session("session store lock poisoned"))
    }
}

impl SessionCarrier for InMemorySessionStore {
    fn load(&self, head: &Parts) -> Result<Session, LiveError> {
        let Some(session_id) = self.session_id(&head.headers) else {
            return Ok(Session::new());
        };

        let sessions = self
            .sessions
            .read()
            .map_err(|_| LiveError::session("session store lock poisoned"))?;
        let Some(stored) = sessions.get(&session_id) else {
            return Ok(Session::new());
        };
        if stored.is_expired(self.max_age) {
            return Ok(Session::new());
        }

        let mut session = stored
            .data
            .get(SESSION_KEY)
            .and_then(|blob| serde_json::from_value::<Session>(blob.clone()).ok())
            .unwrap_or_default();
        session.merge_native(stored.data.iter());
        Ok(session)
    }

    fn save(&self, head: &Parts, session: &Session) -> Result<Option<HeaderValue>, LiveError> {
        let blob = serde_json::to_value(session)?;
        let mut sessions = self.write()?;

        let session_id = match self.session_id(&head.headers) {
            Some(id) if sessions.get(&id).is_some_and(|s| !s.is_expired(self.max_age)) => id,
            _ => Uuid::new_v4().to_string(),
        };

        let stored = sessions
            .entry(session_id.clone())
            .or_insert_with(StoredSession::new);
        stored.touch();
        stored.data.insert(SESSION_KEY.to_string(), blob);
        drop(sessions);

        self.cookie(&session_id).map(Some)
    }

    fn destroy(&self, head: &Parts) -> Result<(), LiveError> {
        if let Some(session_id) = self.session_id(&head.headers) {
            self.write()?.remove(&session_id);
        }
        Ok(())
    }
}

/// Find `name=<value>` in a `Cookie` header.
pub fn extract_session_id(cookies: Option<&str>, name: &str) -> Option<String> {
    cookies.and_then(|cookies| {
        cookies.split(';').find_map(|cookie| {
            let (key, value) = cookie.trim().split_once('=')?;
            (key == name && !value.is_empty()).then(|| value.to_string())
        })
    })
}
