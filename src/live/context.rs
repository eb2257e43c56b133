//! Context handed to every handler.

use std::sync::Arc;

use hyper::http::request::Parts;
use uuid::Uuid;

use crate::live::views::ViewSource;

/// Where the current handler call originates.
///
/// The stateless pass still has the HTTP request; the duplex pass only has
/// the connection and whatever was captured when it was upgraded.
#[derive(Clone)]
pub enum LiveContext<'a> {
    Request {
        head: &'a Parts,
        views: Option<Arc<dyn ViewSource>>,
    },
    Connection {
        id: Uuid,
        views: Option<Arc<dyn ViewSource>>,
    },
}

impl<'a> LiveContext<'a> {
    pub fn request(head: &'a Parts, views: Option<Arc<dyn ViewSource>>) -> Self {
        Self::Request { head, views }
    }

    pub fn connection(id: Uuid, views: Option<Arc<dyn ViewSource>>) -> Self {
        Self::Connection { id, views }
    }

    /// The initiating HTTP request. `None` once the connection is upgraded.
    pub fn http_request(&self) -> Option<&'a Parts> {
        match self {
            Self::Request { head, .. } => Some(*head),
            Self::Connection { .. } => None,
        }
    }

    /// The duplex connection id. `None` before the upgrade.
    pub fn connection_id(&self) -> Option<Uuid> {
        match self {
            Self::Request { .. } => None,
            Self::Connection { id, .. } => Some(*id),
        }
    }

    pub fn views(&self) -> Option<&Arc<dyn ViewSource>> {
        match self {
            Self::Request { views, .. } | Self::Connection { views, .. } => views.as_ref(),
        }
    }
}
