//! The live engine: entry point for both passes of a live view.
//!
//! A plain HTTP request gets the stateless pass (mount, params, render into a
//! full HTML response). A WebSocket upgrade request captures the session and
//! query params into a [`Handoff`] and hands the upgraded stream to the duplex
//! connection loop.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Sink, Stream};
use http_body_util::Full;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::http::request::Parts;
use hyper::http::Extensions;
use hyper::{Request, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tungstenite::{Error as WsError, Message};

use crate::config::LiveConfig;
use crate::error::LiveError;
use crate::live::connection::{self, Handoff};
use crate::live::context::LiveContext;
use crate::live::handler::Handler;
use crate::live::params::Params;
use crate::live::registry::SocketRegistry;
use crate::live::render::render_socket;
use crate::live::session::{Session, SessionCarrier};
use crate::live::socket::Socket;
use crate::live::views::ViewSource;

#[derive(Clone)]
pub struct LiveEngine {
    handler: Arc<Handler>,
    sessions: Arc<dyn SessionCarrier>,
    registry: SocketRegistry,
    views: Option<Arc<dyn ViewSource>>,
    config: LiveConfig,
    shutdown: CancellationToken,
}

impl LiveEngine {
    pub fn new(handler: Handler, sessions: Arc<dyn SessionCarrier>) -> Self {
        Self {
            handler: Arc::new(handler),
            sessions,
            registry: SocketRegistry::new(),
            views: None,
            config: LiveConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: LiveConfig) -> Self {
        self.config = config;
        self
    }

    /// Views exposed to handlers through [`LiveContext::views`].
    pub fn with_views(mut self, views: Arc<dyn ViewSource>) -> Self {
        self.views = Some(views);
        self
    }

    /// Share a registry between engines.
    pub fn with_registry(mut self, registry: SocketRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    pub fn registry(&self) -> &SocketRegistry {
        &self.registry
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Stop every duplex connection of this engine and the accept loop
    /// serving it.
    pub fn shutdown(&self) {
        tracing::info!(connections = self.registry.len(), "live engine shutting down");
        self.shutdown.cancel();
    }

    /// Drop the visitor's session from the carrier.
    pub fn clear_session(&self, head: &Parts) -> Result<(), LiveError> {
        self.sessions.destroy(head)
    }

    /// Serve a request, turning failures into an error response.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Send + 'static,
    {
        match self.serve_http(req).await {
            Ok(response) => response,
            Err(err) => error_response(&err),
        }
    }

    /// Serve one request: the stateless render, or the upgrade to the duplex
    /// phase when the request asks for a WebSocket.
    pub async fn serve_http<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, LiveError>
    where
        B: Send + 'static,
    {
        let (head, body) = req.into_parts();

        let session = match self.sessions.load(&head) {
            Ok(session) => session,
            Err(err) => {
                let ctx = LiveContext::request(&head, self.views.clone());
                self.handler.report_error(&ctx, &err);
                return Err(err);
            }
        };

        if is_websocket_upgrade(&head.headers) {
            return self.upgrade(head, body, session);
        }

        let ctx = LiveContext::request(&head, self.views.clone());
        match self.render_page(&ctx, &head, session).await {
            Ok(response) => Ok(response),
            Err(err) => {
                self.handler.report_error(&ctx, &err);
                Err(err)
            }
        }
    }

    async fn render_page(
        &self,
        ctx: &LiveContext<'_>,
        head: &Parts,
        session: Session,
    ) -> Result<Response<Full<Bytes>>, LiveError> {
        let mut socket = Socket::new(session);

        self.handler.mount(ctx, &mut socket)?;
        self.handler.run_params(ctx, &mut socket, &Params::from_uri(&head.uri))?;
        let output = render_socket(ctx, &self.handler, &socket).await?;
        socket.update_render(output.clone());

        // Handlers may have changed the session; save what they left.
        let set_cookie = {
            let session = socket.session();
            self.sessions.save(head, &session)?
        };

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8");
        if let Some(cookie) = set_cookie {
            response = response.header(header::SET_COOKIE, cookie);
        }
        Ok(response.body(Full::new(Bytes::from(output)))?)
    }

    /// Answer the handshake and run the duplex phase on the upgraded stream
    /// in its own task. Nothing is rendered here.
    fn upgrade<B>(
        &self,
        head: Parts,
        body: B,
        session: Session,
    ) -> Result<Response<Full<Bytes>>, LiveError> {
        let handoff =
            Handoff::new(session, Params::from_uri(&head.uri)).with_views(self.views.clone());

        let mut req = Request::from_parts(head, body);
        let (response, websocket) =
            hyper_tungstenite::upgrade(&mut req, None).map_err(LiveError::upgrade)?;

        let mut carried = std::mem::take(req.extensions_mut());
        carried.insert(handoff);

        let engine = self.clone();
        tokio::spawn(async move {
            let stream = match websocket.await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "websocket upgrade failed");
                    return;
                }
            };
            match engine.serve_connection(stream, carried).await {
                Ok(()) => tracing::debug!("live connection closed"),
                Err(e) => tracing::warn!(error = %e, "live connection ended with error"),
            }
        });

        Ok(response)
    }

    /// Run the duplex phase on an already upgraded stream. `carried` must hold
    /// the [`Handoff`] captured from the upgrading request.
    pub async fn serve_connection<S>(&self, stream: S, carried: Extensions) -> Result<(), LiveError>
    where
        S: Stream<Item = Result<Message, WsError>>
            + Sink<Message, Error = WsError>
            + Send
            + Unpin
            + 'static,
    {
        connection::run(self, stream, carried).await
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

fn error_response(err: &LiveError) -> Response<Full<Bytes>> {
    let status = match err {
        LiveError::Upgrade(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = Response::new(Full::new(Bytes::from(err.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
