//! `portkeeperd` — binary wiring for the portkeeper reverse proxy. Parses
//! CLI flags, loads `Config`, builds the `HostRouter` over the default
//! filesystem `SymlinkHostResolver`, binds a TCP listener, and dispatches
//! every connection through the `Pipeline`. Installs a signal handler so
//! `HostRouter::close_all()` runs before the process exits.
//!
//! The port-80 forwarding rule and daemon-installation tooling are handled
//! by separate collaborators (an install script and a privileged helper);
//! this binary only binds the configured `bind_addr` directly.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use clap::Parser;
use hyper::Request;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use portkeeper::config::Config;
use portkeeper::host_router::{HostRouter, SymlinkHostResolver};
use portkeeper::logging;
use portkeeper::pipeline::Pipeline;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "portkeeperd", about = "Local HTTP reverse proxy")]
struct Cli {
    /// Path to a TOML config file layered over the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `Config::root` — the directory of hosted application roots.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Overrides `Config::bind_addr`.
    #[arg(long)]
    bind: Option<String>,

    /// Overrides `Config::domain`.
    #[arg(long)]
    domain: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        config.root = root;
    }
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(domain) = cli.domain {
        config.domain = domain;
    }

    logging::init(&config.log_level);
    let config = Arc::new(config);

    let resolver = Arc::new(SymlinkHostResolver::new(config.root.clone(), config.domain.clone()));
    let host_router = HostRouter::new(resolver, config.clone());
    let pipeline = Arc::new(Pipeline::new(host_router));

    let listener = TcpListener::bind(config.bind_addr.as_str()).await?;
    info!(addr = %config.bind_addr, "portkeeperd listening");

    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "failed to accept connection");
                        continue;
                    }
                };
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, pipeline).await {
                        warn!(%err, peer = %peer, "connection error");
                    }
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, closing all applications");
                pipeline.host_router().close_all().await;
                break;
            }
        }
    }

    Ok(())
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    pipeline: Arc<Pipeline>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
        let pipeline = pipeline.clone();
        async move {
            let req = req.map(Body::new);
            Ok::<_, std::convert::Infallible>(pipeline.dispatch(req).await)
        }
    });

    auto::Builder::new(hyper_util::rt::TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|err| {
            error!(%err, "error serving connection");
            anyhow::anyhow!("connection error: {err}")
        })
}

/// SIGTERM/SIGINT; mirrors the graceful shutdown convention the
/// daemon-installation tooling relies on.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
