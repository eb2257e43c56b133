//! LiveView - server-rendered HTML kept live over a WebSocket.
//!
//! A page is rendered once statelessly over plain HTTP. The browser then
//! upgrades to a WebSocket on the same route; from there on inbound events
//! update the socket's assigns, and each re-render is sent back as a patch
//! followed by an acknowledgement.

pub mod connection;
pub mod context;
pub mod diff;
pub mod engine;
pub mod event;
pub mod handler;
pub mod params;
pub mod registry;
pub mod render;
pub mod session;
pub mod socket;
pub mod views;

pub use connection::Handoff;
pub use context::LiveContext;
pub use diff::{compute_patch, PatchOp};
pub use engine::LiveEngine;
pub use event::{ErrorEvent, Event, EVENT_ACK, EVENT_ERROR, EVENT_PARAMS, EVENT_PATCH};
pub use handler::Handler;
pub use params::Params;
pub use registry::{Registration, RegisteredSocket, SocketRegistry};
pub use render::{render_socket, RenderContext};
pub use session::{InMemorySessionStore, Session, SessionCarrier, SessionValue, SESSION_KEY};
pub use socket::{into_assigns, Assigns, Socket};
pub use views::{with_views_renderer, TemplateViews, ViewSource};
