//! Rendering a socket and turning the output into a patch.

use crate::error::LiveError;
use crate::live::context::LiveContext;
use crate::live::diff::compute_patch;
use crate::live::event::Event;
use crate::live::handler::Handler;
use crate::live::socket::{Assigns, Socket};

/// Input of the render function.
pub struct RenderContext<'a> {
    pub assigns: &'a Assigns,
    pub connected: bool,
}

impl<'a> RenderContext<'a> {
    pub fn new(socket: &'a Socket) -> Self {
        Self {
            assigns: socket.assigns(),
            connected: socket.is_connected(),
        }
    }
}

/// Render the socket's current assigns. On a connected socket the difference
/// to the previous render is queued as a patch; nothing is queued when the
/// output did not change. The caller records the returned output as the new
/// baseline.
pub async fn render_socket(
    ctx: &LiveContext<'_>,
    handler: &Handler,
    socket: &Socket,
) -> Result<String, LiveError> {
    let output = handler
        .render(ctx, &RenderContext::new(socket))
        .map_err(|e| match e {
            LiveError::Render(_) => e,
            other => LiveError::render(other.to_string()),
        })?;

    if socket.is_connected() {
        let patch = compute_patch(socket.latest_render(), &output);
        if !patch.is_empty() {
            socket.send(Event::patch(&patch)?).await?;
        }
    }

    Ok(output)
}
