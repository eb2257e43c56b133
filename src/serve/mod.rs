//! HTTP/1 server hosting a live engine.
//!
//! Every accepted connection is served by hyper with upgrades enabled so a
//! request can switch to the WebSocket duplex phase. The accept loop stops
//! when the engine is shut down.

pub mod env_loader;

pub use env_loader::{load_env_file, load_env_files};

use std::convert::Infallible;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::error::LiveError;
use crate::live::engine::LiveEngine;

/// Accept connections on `listener` and serve each through `engine` until
/// [`LiveEngine::shutdown`] is called.
pub async fn serve(listener: TcpListener, engine: LiveEngine) -> Result<(), LiveError> {
    let shutdown = engine.shutdown_token().clone();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "live server listening");
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let engine = engine.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let engine = engine.clone();
                async move { Ok::<_, Infallible>(engine.handle(req).await) }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                tracing::debug!(%peer, error = %e, "http connection error");
            }
        });
    }

    tracing::info!("live server stopped");
    Ok(())
}
