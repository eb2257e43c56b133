//! Livehyper: the server side of a live-view protocol.
//!
//! A live view is rendered once over plain HTTP and then kept in sync over a
//! WebSocket: client events update server-side state, and every re-render is
//! pushed back as a patch against the previous render.
//!
//! # Modules
//!
//! - [`live`]: sessions, sockets, the dispatch table and both request passes
//! - [`serve`]: an HTTP/1 accept loop hosting a [`live::LiveEngine`]
//! - [`config`]: engine configuration from the environment
//! - [`error`]: the crate's error type

// Allow some clippy lints that are stylistic and not critical
#![allow(clippy::module_inception)]
#![allow(clippy::result_large_err)]
#![allow(clippy::type_complexity)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod error;
pub mod live;
pub mod serve;

pub use config::LiveConfig;
pub use error::LiveError;
pub use live::{Handler, LiveEngine};
