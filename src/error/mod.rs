//! Error types for the live protocol.

use std::time::Duration;

use thiserror::Error;

/// Every failure the live engine can surface.
///
/// The variants fall into the classes the connection loop cares about:
/// setup errors (`Session`, `MissingSession`), the non-error
/// `NoEventHandler`, recoverable application errors (`Handler`), and errors
/// that are fatal for a single connection (`Render`, `Decode`, `Transport`,
/// `WriteTimeout`, `AbnormalClose`).
#[derive(Debug, Error)]
pub enum LiveError {
    #[error("could not get session: {0}")]
    Session(String),

    #[error("could not get session from connection state")]
    MissingSession,

    #[error("no event handler for '{0}'")]
    NoEventHandler(String),

    #[error("{0}")]
    Handler(String),

    #[error("render error: {0}")]
    Render(String),

    #[error("could not decode event: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("write deadline of {0:?} exceeded")]
    WriteTimeout(Duration),

    #[error("connection closed abnormally: {0}")]
    AbnormalClose(String),

    #[error("socket is not connected")]
    NotConnected,

    #[error("outbound queue closed")]
    QueueClosed,

    #[error("outbound queue full")]
    QueueFull,

    #[error("websocket upgrade error: {0}")]
    Upgrade(String),

    #[error("could not build response: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LiveError {
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }

    pub fn no_event_handler(event: impl Into<String>) -> Self {
        Self::NoEventHandler(event.into())
    }

    /// An application error raised while handling one event.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    pub fn render(message: impl Into<String>) -> Self {
        Self::Render(message.into())
    }

    pub fn upgrade(message: impl ToString) -> Self {
        Self::Upgrade(message.to_string())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_no_event_handler(&self) -> bool {
        matches!(self, Self::NoEventHandler(_))
    }
}
