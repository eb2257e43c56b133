//! Duplex connection loop.
//!
//! One connection runs two activities: the inbound task owns the [`Socket`],
//! decodes frames, dispatches them and queues the resulting patches and acks;
//! the write loop in the connection's own task is the only writer to the
//! transport and multiplexes the outbound queue, event errors, the inbound
//! task's termination signal and engine shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use hyper::http::Extensions;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tungstenite::error::ProtocolError;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::{Error as WsError, Message};

use crate::error::LiveError;
use crate::live::context::LiveContext;
use crate::live::engine::LiveEngine;
use crate::live::event::{ErrorEvent, Event, EVENT_PARAMS};
use crate::live::handler::Handler;
use crate::live::params::Params;
use crate::live::render::render_socket;
use crate::live::session::Session;
use crate::live::socket::Socket;
use crate::live::views::ViewSource;

/// State carried from the upgrading request into the duplex phase. Stored
/// in the request extensions at upgrade time.
#[derive(Clone)]
pub struct Handoff {
    session: Session,
    params: Params,
    views: Option<Arc<dyn ViewSource>>,
}

impl Handoff {
    pub fn new(session: Session, params: Params) -> Self {
        Self {
            session,
            params,
            views: None,
        }
    }

    pub fn with_views(mut self, views: Option<Arc<dyn ViewSource>>) -> Self {
        self.views = views;
        self
    }

    pub fn into_extensions(self) -> Extensions {
        let mut extensions = Extensions::new();
        extensions.insert(self);
        extensions
    }
}

/// Why the inbound task stopped.
#[derive(Debug)]
enum ReadEnd {
    /// Mount, params or the first render failed.
    SetupFailed(LiveError),
    /// The peer closed the connection normally.
    Closed,
    Failed(LiveError),
}

pub(crate) async fn run<S>(
    engine: &LiveEngine,
    stream: S,
    mut carried: Extensions,
) -> Result<(), LiveError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin + 'static,
{
    let handoff = carried
        .remove::<Handoff>()
        .ok_or(LiveError::MissingSession)?;
    let config = engine.config();

    let (outbound_tx, outbound_rx) = async_channel::bounded(config.outbound_capacity);
    let (event_errors_tx, event_errors_rx) = async_channel::bounded(config.outbound_capacity);
    let (internal_tx, internal_rx) = oneshot::channel();

    let socket = Socket::connected(handoff.session, outbound_tx.clone());
    let _registration = engine.registry().register(socket.id(), outbound_tx);
    let ctx = LiveContext::connection(socket.id(), handoff.views);

    let (writer, reader) = stream.split();
    let read_task = tokio::spawn(read_loop(
        reader,
        socket,
        ctx,
        engine.handler().clone(),
        handoff.params,
        event_errors_tx,
        internal_tx,
    ));

    let result = write_loop(
        writer,
        outbound_rx,
        event_errors_rx,
        internal_rx,
        engine.shutdown_token().clone(),
        config.write_deadline,
    )
    .await;

    // The inbound task may still be parked on a read; nothing it does past
    // this point can reach the client.
    read_task.abort();
    result
}

async fn read_loop<R>(
    mut reader: R,
    mut socket: Socket,
    ctx: LiveContext<'static>,
    handler: Arc<Handler>,
    params: Params,
    event_errors: async_channel::Sender<ErrorEvent>,
    internal: oneshot::Sender<ReadEnd>,
) where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let end = match mount(&ctx, &handler, &mut socket, &params).await {
        Ok(()) => read_frames(&mut reader, &mut socket, &ctx, &handler, &event_errors).await,
        Err(err) => {
            handler.report_error(&ctx, &err);
            ReadEnd::SetupFailed(err)
        }
    };
    let _ = internal.send(end);
}

/// Re-run mount and params now that the socket is connected, then render
/// once so the client gets the connected view.
async fn mount(
    ctx: &LiveContext<'_>,
    handler: &Handler,
    socket: &mut Socket,
    params: &Params,
) -> Result<(), LiveError> {
    handler.mount(ctx, socket)?;
    handler.run_params(ctx, socket, params)?;
    let render = render_socket(ctx, handler, socket).await?;
    socket.update_render(render);
    Ok(())
}

async fn read_frames<R>(
    reader: &mut R,
    socket: &mut Socket,
    ctx: &LiveContext<'_>,
    handler: &Handler,
    event_errors: &async_channel::Sender<ErrorEvent>,
) -> ReadEnd
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let message = match reader.next().await {
            None => return ReadEnd::Closed,
            Some(Err(err)) => return classify_transport_error(err),
            Some(Ok(message)) => message,
        };

        match message {
            Message::Text(text) => {
                let event = match Event::from_text(&text) {
                    Ok(event) => event,
                    Err(err) => return ReadEnd::Failed(err),
                };
                if let Err(err) = handle_frame(ctx, handler, socket, event, event_errors).await {
                    return ReadEnd::Failed(err);
                }
            }
            Message::Binary(data) => {
                tracing::debug!(bytes = data.len(), "binary messages unhandled");
            }
            Message::Close(frame) => return classify_close(frame),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}

/// Dispatch one decoded envelope, then render and acknowledge it. Handler
/// errors are reported to the client; render and queue failures are fatal.
async fn handle_frame(
    ctx: &LiveContext<'_>,
    handler: &Handler,
    socket: &mut Socket,
    event: Event,
    event_errors: &async_channel::Sender<ErrorEvent>,
) -> Result<(), LiveError> {
    let outcome = if event.t == EVENT_PARAMS {
        handler.call_params(ctx, socket, &event)
    } else {
        handler.call_event(ctx, socket, &event)
    };

    match outcome {
        Ok(()) => {}
        Err(err) if err.is_no_event_handler() => {
            tracing::info!(event = %event.t, id = %event.id, "event error: {}", err);
        }
        Err(err) => {
            event_errors
                .send(ErrorEvent::new(event.clone(), err.to_string()))
                .await
                .map_err(|_| LiveError::QueueClosed)?;
        }
    }

    let render = render_socket(ctx, handler, socket).await?;
    socket.update_render(render);
    socket.send(Event::ack(&event.id)).await
}

fn classify_close(frame: Option<CloseFrame<'static>>) -> ReadEnd {
    match frame {
        None => ReadEnd::Closed,
        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => ReadEnd::Closed,
        Some(frame) => ReadEnd::Failed(LiveError::AbnormalClose(format!(
            "{} {}",
            u16::from(frame.code),
            frame.reason
        ))),
    }
}

fn classify_transport_error(err: WsError) -> ReadEnd {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ReadEnd::Closed,
        other => ReadEnd::Failed(LiveError::Transport(other)),
    }
}

/// Write whatever becomes ready first until the connection ends.
///
/// Ties are broken in this order: shutdown, event errors, outbound queue,
/// inbound termination. Patches and acks queued before the inbound task
/// stopped are therefore flushed before the loop acts on its termination.
async fn write_loop<W>(
    mut writer: W,
    outbound: async_channel::Receiver<Event>,
    event_errors: async_channel::Receiver<ErrorEvent>,
    mut internal: oneshot::Receiver<ReadEnd>,
    shutdown: CancellationToken,
    deadline: Duration,
) -> Result<(), LiveError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => return Ok(()),

            Ok(error) = event_errors.recv() => {
                let event = Event::event_error(&error)?;
                if let Err(err) = write_event(&mut writer, &event, deadline).await {
                    return write_failed(err, &mut internal, deadline).await;
                }
            }

            Ok(event) = outbound.recv() => {
                if let Err(err) = write_event(&mut writer, &event, deadline).await {
                    return write_failed(err, &mut internal, deadline).await;
                }
            }

            end = &mut internal => {
                return match end {
                    Ok(ReadEnd::Closed) => Ok(()),
                    Ok(ReadEnd::SetupFailed(err)) => Err(err),
                    Ok(ReadEnd::Failed(err)) => {
                        let event = Event::internal_error(&err);
                        if let Err(e) = write_event(&mut writer, &event, deadline).await {
                            tracing::debug!(error = %e, "could not send connection error to client");
                        }
                        Err(err)
                    }
                    Err(_) => Err(LiveError::AbnormalClose(
                        "inbound task ended unexpectedly".to_string(),
                    )),
                };
            }
        }
    }
}

/// Outcome of a failed write. Once the peer has started the close handshake
/// the transport refuses writes, and the inbound task's verdict on that close
/// decides the result.
async fn write_failed(
    err: LiveError,
    internal: &mut oneshot::Receiver<ReadEnd>,
    deadline: Duration,
) -> Result<(), LiveError> {
    if !is_closing(&err) {
        return Err(err);
    }
    match tokio::time::timeout(deadline, internal).await {
        Ok(Ok(ReadEnd::Closed)) => Ok(()),
        Ok(Ok(ReadEnd::Failed(cause) | ReadEnd::SetupFailed(cause))) => Err(cause),
        _ => Err(err),
    }
}

fn is_closing(err: &LiveError) -> bool {
    matches!(
        err,
        LiveError::Transport(
            WsError::ConnectionClosed
                | WsError::AlreadyClosed
                | WsError::Protocol(ProtocolError::SendAfterClosing)
        )
    )
}

async fn write_event<W>(writer: &mut W, event: &Event, deadline: Duration) -> Result<(), LiveError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let message = event.to_message()?;
    match tokio::time::timeout(deadline, writer.send(message)).await {
        Ok(result) => result.map_err(LiveError::from),
        Err(_) => Err(LiveError::WriteTimeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LiveConfig;
    use crate::live::event::{EVENT_ACK, EVENT_ERROR, EVENT_PATCH};
    use crate::live::session::InMemorySessionStore;
    use crate::live::socket::{into_assigns, Assigns};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    const WAIT: Duration = Duration::from_secs(5);

    type Client = WebSocketStream<DuplexStream>;

    fn counter_handler() -> Handler {
        Handler::new()
            .on_mount(|_, _| Ok(into_assigns(json!({"count": 0}))))
            .on_event("inc", |_, socket, _| {
                let count = socket.assigns().get("count").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(into_assigns(json!({"count": count + 1})))
            })
            .on_event("boom", |_, _, _| Err(LiveError::handler("boom failed")))
            .on_event("explode", |_, _, _| Ok(into_assigns(json!({"explode": true}))))
            .on_render(|_, rc| {
                if rc.assigns.get("explode").is_some() {
                    return Err(LiveError::render("template exploded"));
                }
                Ok(format!(
                    "<p>{}</p>",
                    rc.assigns.get("count").cloned().unwrap_or(json!(0))
                ))
            })
    }

    fn engine(handler: Handler) -> LiveEngine {
        LiveEngine::new(handler, Arc::new(InMemorySessionStore::default()))
    }

    fn carried(query: &str) -> Extensions {
        Handoff::new(Session::new(), Params::from_query(query)).into_extensions()
    }

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, Client) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        (server, client)
    }

    async fn connect(engine: &LiveEngine, query: &str) -> (Client, JoinHandle<Result<(), LiveError>>) {
        let (server, client) = ws_pair().await;
        let engine = engine.clone();
        let carried = carried(query);
        let task = tokio::spawn(async move { engine.serve_connection(server, carried).await });
        (client, task)
    }

    async fn send(client: &mut Client, t: &str, id: &str) {
        let text = serde_json::to_string(&Event::new(t).with_id(id)).unwrap();
        client.send(Message::text(text)).await.unwrap();
    }

    /// Next text envelope, `None` once the connection is gone.
    async fn next_event(client: &mut Client) -> Option<Event> {
        loop {
            match tokio::time::timeout(WAIT, client.next()).await.ok()?? {
                Ok(Message::Text(text)) => return Some(Event::from_text(&text).unwrap()),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Collect envelopes until `acks` acknowledgements arrived.
    async fn until_acks(client: &mut Client, acks: usize) -> Vec<Event> {
        let mut events = Vec::new();
        while events.iter().filter(|e: &&Event| e.t == EVENT_ACK).count() < acks {
            events.push(next_event(client).await.expect("connection ended early"));
        }
        events
    }

    #[tokio::test]
    async fn test_first_render_is_sent_as_full_replace() {
        let engine = engine(counter_handler());
        let (mut client, _task) = connect(&engine, "").await;

        let first = next_event(&mut client).await.unwrap();
        assert_eq!(first.t, EVENT_PATCH);
        assert_eq!(first.data, Some(json!([{"op": "replace", "html": "<p>0</p>"}])));
        assert_eq!(engine.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_every_processed_frame_is_acked_once() {
        let engine = engine(counter_handler());
        let (mut client, _task) = connect(&engine, "").await;

        send(&mut client, "inc", "1").await;
        send(&mut client, "unknown", "2").await;
        send(&mut client, EVENT_PARAMS, "3").await;
        send(&mut client, "inc", "4").await;

        let events = until_acks(&mut client, 4).await;
        let acks: Vec<&str> = events
            .iter()
            .filter(|e| e.t == EVENT_ACK)
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(acks, vec!["1", "2", "3", "4"]);
        assert!(events.iter().all(|e| e.t != EVENT_ERROR));

        // Each patch precedes the ack of the frame that produced it.
        let ack_of_first = events.iter().position(|e| e.t == EVENT_ACK).unwrap();
        assert!(events[..ack_of_first]
            .iter()
            .any(|e| e.t == EVENT_PATCH && e.data.as_ref().unwrap().to_string().contains("<p>1</p>")));
    }

    #[tokio::test]
    async fn test_event_error_keeps_connection_open() {
        let engine = engine(counter_handler());
        let (mut client, _task) = connect(&engine, "").await;

        send(&mut client, "boom", "2").await;
        let events = until_acks(&mut client, 1).await;
        let errors: Vec<&Event> = events.iter().filter(|e| e.t == EVENT_ERROR).collect();
        assert_eq!(errors.len(), 1);
        let data = errors[0].data.as_ref().unwrap();
        assert_eq!(data["source"]["id"], json!("2"));
        assert_eq!(data["err"], json!("boom failed"));

        send(&mut client, "inc", "3").await;
        let events = until_acks(&mut client, 1).await;
        assert_eq!(events.last().unwrap().id, "3");
    }

    #[tokio::test]
    async fn test_render_failure_ends_only_that_connection() {
        let engine = engine(counter_handler());
        let (mut doomed, doomed_task) = connect(&engine, "").await;
        let (mut healthy, _healthy_task) = connect(&engine, "").await;
        next_event(&mut doomed).await.unwrap();
        next_event(&mut healthy).await.unwrap();

        send(&mut doomed, "explode", "1").await;
        let result = tokio::time::timeout(WAIT, doomed_task).await.unwrap().unwrap();
        assert!(matches!(result, Err(LiveError::Render(_))));

        let error = next_event(&mut doomed).await.unwrap();
        assert_eq!(error.t, EVENT_ERROR);
        assert_eq!(error.data, Some(json!("render error: template exploded")));
        assert!(next_event(&mut doomed).await.is_none());

        send(&mut healthy, "inc", "9").await;
        let events = until_acks(&mut healthy, 1).await;
        assert_eq!(events.last().unwrap().id, "9");
        assert_eq!(engine.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_duplex_params_are_the_handshake_params() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = counter_handler().on_params(move |ctx, _, params| {
            if ctx.connection_id().is_some() {
                sink.lock().unwrap().push(params.clone());
            }
            Ok(Assigns::new())
        });
        let engine = engine(handler);
        let (mut client, _task) = connect(&engine, "a=1&b=2").await;
        next_event(&mut client).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get("a"), Some("1"));
        assert_eq!(seen[0].get("b"), Some("2"));
        assert_eq!(seen[0].len(), 2);
    }

    #[tokio::test]
    async fn test_normal_close_is_clean() {
        let engine = engine(counter_handler());
        let (mut client, task) = connect(&engine, "").await;
        next_event(&mut client).await.unwrap();
        send(&mut client, "inc", "1").await;
        until_acks(&mut client, 1).await;

        client
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            }))
            .await
            .unwrap();

        let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(result.is_ok());
        while let Some(event) = next_event(&mut client).await {
            assert_ne!(event.t, EVENT_ERROR);
        }
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_close_with_output_still_queued_is_clean() {
        let engine = engine(counter_handler());
        let (mut client, task) = connect(&engine, "").await;
        next_event(&mut client).await.unwrap();

        send(&mut client, "inc", "1").await;
        client
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await
            .unwrap();

        let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(result.is_ok(), "normal close ended with {:?}", result);
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_abnormal_close_keeps_its_cause() {
        let engine = engine(counter_handler());
        let (mut client, task) = connect(&engine, "").await;
        next_event(&mut client).await.unwrap();

        client
            .close(Some(CloseFrame {
                code: CloseCode::Error,
                reason: "oops".into(),
            }))
            .await
            .unwrap();

        let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        match result {
            Err(LiveError::AbnormalClose(reason)) => assert_eq!(reason, "1011 oops"),
            other => panic!("expected an abnormal close, got {:?}", other),
        }
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_abrupt_disconnect_is_contained() {
        let engine = engine(counter_handler());
        let (mut client, task) = connect(&engine, "").await;
        next_event(&mut client).await.unwrap();

        drop(client);
        let result = tokio::time::timeout(WAIT, task).await.unwrap();
        assert!(result.is_ok(), "connection task must not panic");
        assert!(result.unwrap().is_err());
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_write_loop() {
        let engine = engine(counter_handler());
        let (mut client, task) = connect(&engine, "").await;
        next_event(&mut client).await.unwrap();
        assert_eq!(engine.registry().len(), 1);

        engine.shutdown();
        let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_missing_session_never_registers() {
        let engine = engine(counter_handler());
        let (server, _client) = ws_pair().await;
        let result = engine.serve_connection(server, Extensions::new()).await;
        assert!(matches!(result, Err(LiveError::MissingSession)));
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_mount_failure_ends_setup() {
        let engine = engine(counter_handler().on_mount(|_, _| Err(LiveError::handler("no access"))));
        let (_client, task) = connect(&engine, "").await;
        let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(result, Err(LiveError::Handler(_))));
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_fatal() {
        let engine = engine(counter_handler());
        let (mut client, task) = connect(&engine, "").await;
        next_event(&mut client).await.unwrap();

        client.send(Message::text("{not json")).await.unwrap();
        let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(result, Err(LiveError::Decode(_))));
    }

    #[tokio::test]
    async fn test_binary_frames_are_dropped() {
        let engine = engine(counter_handler());
        let (mut client, _task) = connect(&engine, "").await;
        next_event(&mut client).await.unwrap();

        client.send(Message::binary(vec![1, 2, 3])).await.unwrap();
        send(&mut client, "inc", "1").await;
        let events = until_acks(&mut client, 1).await;
        assert_eq!(events.last().unwrap().id, "1");
    }

    #[tokio::test]
    async fn test_application_push_reaches_client() {
        let handler = counter_handler().on_event("notify", |_, socket, _| {
            socket.push("notice", json!("hello"))?;
            Ok(Assigns::new())
        });
        let engine = engine(handler);
        let (mut client, _task) = connect(&engine, "").await;
        next_event(&mut client).await.unwrap();

        send(&mut client, "notify", "5").await;
        let events = until_acks(&mut client, 1).await;
        assert!(events
            .iter()
            .any(|e| e.t == "notice" && e.data == Some(json!("hello"))));
    }

    /// Transport that never delivers a frame and never accepts a write.
    struct StalledTransport;

    impl Stream for StalledTransport {
        type Item = Result<Message, WsError>;

        fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Poll::Pending
        }
    }

    impl Sink<Message> for StalledTransport {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), WsError> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_write_deadline_breach_deregisters() {
        let engine = engine(counter_handler())
            .with_config(LiveConfig::default().with_write_deadline(Duration::from_millis(50)));
        let before = engine.registry().len();

        let result = tokio::time::timeout(
            WAIT,
            engine.serve_connection(StalledTransport, carried("")),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(LiveError::WriteTimeout(_))));
        assert_eq!(engine.registry().len(), before);
    }
}
