//! Dispatch table: the application logic behind a live view.
//!
//! A [`Handler`] is built once and shared by the stateless and the duplex
//! pass. It holds one mount handler, an ordered list of params handlers, the
//! named event handlers, the render function and an error reporter.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::LiveError;
use crate::live::context::LiveContext;
use crate::live::event::Event;
use crate::live::params::Params;
use crate::live::render::RenderContext;
use crate::live::socket::{Assigns, Socket};

pub type MountHandler =
    Arc<dyn Fn(&LiveContext<'_>, &Socket) -> Result<Assigns, LiveError> + Send + Sync>;
pub type ParamsHandler =
    Arc<dyn Fn(&LiveContext<'_>, &Socket, &Params) -> Result<Assigns, LiveError> + Send + Sync>;
pub type EventHandler =
    Arc<dyn Fn(&LiveContext<'_>, &Socket, &Event) -> Result<Assigns, LiveError> + Send + Sync>;
pub type RenderHandler =
    Arc<dyn Fn(&LiveContext<'_>, &RenderContext<'_>) -> Result<String, LiveError> + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&LiveContext<'_>, &LiveError) + Send + Sync>;

#[derive(Clone)]
pub struct Handler {
    mount: MountHandler,
    params: Vec<ParamsHandler>,
    events: HashMap<String, EventHandler>,
    render: RenderHandler,
    error: ErrorHandler,
}

impl Default for Handler {
    fn default() -> Self {
        Self {
            mount: Arc::new(|_, _| Ok(Assigns::new())),
            params: Vec::new(),
            events: HashMap::new(),
            render: Arc::new(|_, _| Err(LiveError::render("no render handler configured"))),
            error: Arc::new(|ctx, err| {
                tracing::error!(
                    connection = ?ctx.connection_id(),
                    error = %err,
                    "live handler error"
                );
            }),
        }
    }
}

impl Handler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_mount<F>(mut self, f: F) -> Self
    where
        F: Fn(&LiveContext<'_>, &Socket) -> Result<Assigns, LiveError> + Send + Sync + 'static,
    {
        self.mount = Arc::new(f);
        self
    }

    /// Add a params handler. Handlers run in registration order.
    pub fn on_params<F>(mut self, f: F) -> Self
    where
        F: Fn(&LiveContext<'_>, &Socket, &Params) -> Result<Assigns, LiveError>
            + Send
            + Sync
            + 'static,
    {
        self.params.push(Arc::new(f));
        self
    }

    pub fn on_event<F>(mut self, t: &str, f: F) -> Self
    where
        F: Fn(&LiveContext<'_>, &Socket, &Event) -> Result<Assigns, LiveError>
            + Send
            + Sync
            + 'static,
    {
        self.events.insert(t.to_string(), Arc::new(f));
        self
    }

    pub fn on_render<F>(mut self, f: F) -> Self
    where
        F: Fn(&LiveContext<'_>, &RenderContext<'_>) -> Result<String, LiveError>
            + Send
            + Sync
            + 'static,
    {
        self.render = Arc::new(f);
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&LiveContext<'_>, &LiveError) + Send + Sync + 'static,
    {
        self.error = Arc::new(f);
        self
    }

    /// Run the mount handler and assign its result.
    pub fn mount(&self, ctx: &LiveContext<'_>, socket: &mut Socket) -> Result<(), LiveError> {
        let data = (self.mount)(ctx, socket)?;
        socket.assign(data);
        Ok(())
    }

    /// Run every params handler in order, assigning each result before the
    /// next handler runs.
    pub fn run_params(
        &self,
        ctx: &LiveContext<'_>,
        socket: &mut Socket,
        params: &Params,
    ) -> Result<(), LiveError> {
        for handler in &self.params {
            let data = handler(ctx, socket, params)?;
            socket.assign(data);
        }
        Ok(())
    }

    /// Handle an inbound params update. Without params handlers this is the
    /// "no handler" condition.
    pub fn call_params(
        &self,
        ctx: &LiveContext<'_>,
        socket: &mut Socket,
        event: &Event,
    ) -> Result<(), LiveError> {
        if self.params.is_empty() {
            return Err(LiveError::no_event_handler(&event.t));
        }
        self.run_params(ctx, socket, &event.params())
    }

    /// Handle a named event.
    pub fn call_event(
        &self,
        ctx: &LiveContext<'_>,
        socket: &mut Socket,
        event: &Event,
    ) -> Result<(), LiveError> {
        let handler = self
            .events
            .get(&event.t)
            .ok_or_else(|| LiveError::no_event_handler(&event.t))?;
        let data = handler(ctx, socket, event)?;
        socket.assign(data);
        Ok(())
    }

    pub fn render(&self, ctx: &LiveContext<'_>, rc: &RenderContext<'_>) -> Result<String, LiveError> {
        (self.render)(ctx, rc)
    }

    pub fn report_error(&self, ctx: &LiveContext<'_>, err: &LiveError) {
        (self.error)(ctx, err)
    }
}
