//! Wire envelope exchanged in both directions over the duplex connection.
//!
//! Every frame is a JSON object `{"t": <tag>, "id": <correlation>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tungstenite::Message;

use crate::error::LiveError;
use crate::live::diff::PatchOp;
use crate::live::params::Params;

/// Inbound tag carrying a params update.
pub const EVENT_PARAMS: &str = "params";
/// Outbound acknowledgement of a processed frame.
pub const EVENT_ACK: &str = "ack";
/// Outbound error, either for one event or for the connection.
pub const EVENT_ERROR: &str = "error";
/// Outbound render patch.
pub const EVENT_PATCH: &str = "patch";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub t: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl Event {
    pub fn new(t: impl Into<String>) -> Self {
        Self {
            t: t.into(),
            id: String::new(),
            data: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    /// Acknowledgement echoing the correlation id of the processed frame.
    pub fn ack(id: &str) -> Self {
        Self::new(EVENT_ACK).with_id(id)
    }

    pub fn patch(ops: &[PatchOp]) -> Result<Self, LiveError> {
        Ok(Self::new(EVENT_PATCH).with_data(serde_json::to_value(ops)?))
    }

    /// `{"t":"error","data":{"source":<envelope>,"err":<message>}}`
    pub fn event_error(error: &ErrorEvent) -> Result<Self, LiveError> {
        Ok(Self::new(EVENT_ERROR).with_data(serde_json::to_value(error)?))
    }

    /// `{"t":"error","data":<message>}`
    pub fn internal_error(error: &LiveError) -> Self {
        Self::new(EVENT_ERROR).with_data(JsonValue::String(error.to_string()))
    }

    pub fn from_text(text: &str) -> Result<Self, LiveError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_message(&self) -> Result<Message, LiveError> {
        Ok(Message::text(serde_json::to_string(self)?))
    }

    /// The payload as params. Object members become entries, non-string
    /// values are kept in their JSON text form. Anything else is empty.
    pub fn params(&self) -> Params {
        match &self.data {
            Some(JsonValue::Object(map)) => map
                .iter()
                .map(|(key, value)| {
                    let value = match value {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), value)
                })
                .collect(),
            _ => Params::new(),
        }
    }
}

/// An application error raised while processing one inbound envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub source: Event,
    pub err: String,
}

impl ErrorEvent {
    pub fn new(source: Event, err: impl Into<String>) -> Self {
        Self {
            source,
            err: err.into(),
        }
    }
}
