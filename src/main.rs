//! Livehyper demo server: a live counter.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use livehyper::live::{into_assigns, with_views_renderer, InMemorySessionStore, TemplateViews, ViewSource};
use livehyper::serve::{load_env_files, serve};
use livehyper::{Handler, LiveConfig, LiveEngine, LiveError};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_PORT: u16 = 5011;

const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

const COUNTER_TEMPLATE: &str = r#"<section>
<h1>Count: <%= @count %></h1>
<p>connected: <%= @connected %></p>
<button live-click="dec">-</button>
<button live-click="inc">+</button>
</section>"#;

const LAYOUT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><title>livehyper</title></head>
<body>
<%= yield %>
</body>
</html>"#;

/// CLI options parsed from arguments.
struct Options {
    port: u16,
    views: Option<PathBuf>,
}

fn print_usage() {
    eprintln!("Livehyper {} - live counter demo", VERSION);
    eprintln!();
    eprintln!("Usage: livehyper [--port PORT] [--views DIR]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --port PORT     Port to listen on (default: {})", DEFAULT_PORT);
    eprintln!("  --views DIR     Load counter.html and layout.html from DIR");
    eprintln!("  -h, --help      Show this help message");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RUST_LOG                    Log filter (default: info)");
    eprintln!("  LIVE_WRITE_DEADLINE_MS      Per-write deadline on live connections");
    eprintln!("  LIVE_OUTBOUND_CAPACITY      Outbound queue size per connection");
    eprintln!("  LIVE_SESSION_COOKIE         Session cookie name");
    eprintln!("  LIVE_SESSION_MAX_AGE_SECS   Session lifetime");
}

fn parse_args() -> Options {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut options = Options {
        port: DEFAULT_PORT,
        views: None,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "--port" => {
                i += 1;
                let Some(port) = args.get(i).and_then(|p| p.parse().ok()) else {
                    eprintln!("Error: --port requires a valid port number");
                    process::exit(1);
                };
                options.port = port;
            }
            "--views" => {
                i += 1;
                let Some(dir) = args.get(i) else {
                    eprintln!("Error: --views requires a directory");
                    process::exit(1);
                };
                options.views = Some(PathBuf::from(dir));
            }
            other => {
                eprintln!("Unexpected argument: {}", other);
                print_usage();
                process::exit(1);
            }
        }
        i += 1;
    }

    options
}

fn load_views(dir: Option<&Path>) -> Result<TemplateViews, LiveError> {
    match dir {
        Some(dir) => TemplateViews::from_dir(dir),
        None => Ok(TemplateViews::new()
            .with_template("counter", COUNTER_TEMPLATE)
            .with_template("layout", LAYOUT_TEMPLATE)),
    }
}

fn counter_handler() -> Handler {
    fn count(assigns: &livehyper::live::Assigns) -> i64 {
        assigns.get("count").and_then(|v| v.as_i64()).unwrap_or(0)
    }

    Handler::new()
        .on_mount(|_, _| Ok(into_assigns(json!({"count": 0}))))
        .on_params(|_, _, params| match params.get("count") {
            Some(raw) => {
                let start: i64 = raw
                    .parse()
                    .map_err(|_| LiveError::handler(format!("invalid count: {}", raw)))?;
                Ok(into_assigns(json!({"count": start})))
            }
            None => Ok(Default::default()),
        })
        .on_event("inc", |_, socket, _| {
            Ok(into_assigns(json!({"count": count(socket.assigns()) + 1})))
        })
        .on_event("dec", |_, socket, _| {
            Ok(into_assigns(json!({"count": count(socket.assigns()) - 1})))
        })
        .on_render(with_views_renderer("counter", &["layout"]))
}

async fn run(options: Options, config: LiveConfig) -> Result<(), LiveError> {
    let views: Arc<dyn ViewSource> = Arc::new(load_views(options.views.as_deref())?);
    let sessions = Arc::new(InMemorySessionStore::from_config(&config));
    let engine = LiveEngine::new(counter_handler(), sessions.clone())
        .with_config(config)
        .with_views(views);
    InMemorySessionStore::spawn_cleanup(
        sessions,
        SESSION_CLEANUP_INTERVAL,
        engine.shutdown_token().clone(),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], options.port));
    let listener = TcpListener::bind(addr).await?;

    let signal_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_engine.shutdown();
        }
    });

    serve(listener, engine).await
}

fn main() {
    let options = parse_args();

    // The environment must be complete before any thread is spawned.
    load_env_files(Path::new("."));

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match LiveConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create tokio runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(options, config)) {
        tracing::error!(error = %e, "server failed");
        process::exit(1);
    }
}
