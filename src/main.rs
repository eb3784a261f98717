mod auth;
mod buffer_pool;
mod config;
mod monitor;
mod session;
mod stream;
mod tls;
mod upstream;
mod web;

use crate::auth::CredentialStore;
use crate::config::{Cli, ProxyConfig};
use crate::monitor::{ConnMonitor, GlobalMonitor};
use crate::session::{ConnContext, SessionEngine};
use crate::stream::CountedStream;
use crate::upstream::UpstreamConnector;
use crate::web::Dispatcher;

use clap::Parser;
use color_eyre::eyre::Result;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn, Instrument};
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hproxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = Arc::new(ProxyConfig::from_cli(args)?);

    let acceptor = match &config.tls {
        Some((cert, key)) => Some(tls::build_acceptor(cert, key)?),
        None => None,
    };

    let monitor = GlobalMonitor::new();
    monitor.clone().spawn_sampler();

    let credentials = Arc::new(CredentialStore::new(config.credentials.clone()));
    let connector = UpstreamConnector::new(config.connect_timeout);
    let dispatcher = Arc::new(Dispatcher::new(
        config.web_root.clone(),
        monitor.clone(),
        config.require_auth,
        config.bypass_header.clone(),
    ));
    let engine = Arc::new(SessionEngine::new(
        credentials,
        connector,
        dispatcher,
        config.require_auth,
        config.bypass_header.clone(),
        config.idle_timeout,
    ));

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(
        "{} proxy listening on {}",
        if acceptor.is_some() { "HTTPS" } else { "HTTP" },
        config.listen_addr
    );

    // Graceful shutdown signal handling
    let shutdown = {
        let monitor = monitor.clone();
        async move {
            signal::ctrl_c()
                .await
                .expect("Failed to install CTRL+C handler");

            info!("Shutdown signal received");

            let active = monitor.active_connections();
            if active > 0 {
                info!("Waiting for {} connections to close...", active);

                for i in 1..=30 {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let remaining = monitor.active_connections();

                    if remaining == 0 {
                        info!("All connections closed gracefully");
                        break;
                    }

                    if i % 5 == 0 {
                        info!("Still waiting for {} connections... ({}/30s)", remaining, i);
                    }
                }

                let final_count = monitor.active_connections();
                if final_count > 0 {
                    warn!(
                        "Forced shutdown with {} connections still active",
                        final_count
                    );
                }
            }
        }
    };

    // Main server loop
    let server = {
        let config = Arc::clone(&config);
        async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let engine = engine.clone();
                        let monitor = monitor.clone();
                        let acceptor = acceptor.clone();
                        let idle_timeout = config.idle_timeout;
                        tokio::task::spawn(async move {
                            handle_connection(
                                stream,
                                peer_addr,
                                engine,
                                monitor,
                                acceptor,
                                idle_timeout,
                            )
                            .await;
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {} (continuing)", e);
                        continue;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = server => {
            warn!("Server loop terminated");
        }
        _ = shutdown => {
            info!("Server shutdown complete");
        }
    }

    Ok(())
}

/// Owns one inbound connection end to end: installs the byte-counting
/// wrapper, opens the connection span, performs the optional TLS handshake,
/// drives the session, and arms the supervisory idle watchdog. Teardown
/// flushes the final counters and releases the active slot exactly once.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<SessionEngine>,
    monitor: Arc<GlobalMonitor>,
    acceptor: Option<TlsAcceptor>,
    idle_timeout: Duration,
) {
    let span = tracing::info_span!(
        "conn",
        client = %peer,
        bytes_in = tracing::field::Empty,
        bytes_out = tracing::field::Empty,
    );

    let mut guard = monitor.begin_connection();
    let conn_monitor = ConnMonitor::new(monitor, span.clone());
    let flusher = conn_monitor.spawn_flusher();
    let counted = CountedStream::new(stream, conn_monitor.clone());
    let ctx = ConnContext::new();

    let driver = {
        let ctx = ctx.clone();
        async move {
            let served = match acceptor {
                Some(acceptor) => match acceptor.accept(counted).await {
                    Ok(tls_stream) => serve_io(tls_stream, engine, peer, ctx.clone()).await,
                    Err(e) => {
                        warn!(client = %peer, "tls handshake failed: {}", e);
                        Ok(())
                    }
                },
                None => serve_io(counted, engine, peer, ctx.clone()).await,
            };
            if let Err(e) = served {
                if !e.to_string().contains("connection closed") {
                    warn!(client = %peer, "connection error: {:?}", e);
                }
            }
            // A CONNECT upgrade hands the stream to a tunnel task; the
            // connection is only done once that relay finishes
            if let Some(tunnel) = ctx.take_tunnel() {
                let _ = tunnel.await;
            }
        }
    };

    let watchdog = {
        let conn_monitor = conn_monitor.clone();
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if conn_monitor.idle_for() >= idle_timeout {
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = driver.instrument(span.clone()) => {}
        _ = watchdog => {
            info!(client = %peer, "idle timeout, closing connection");
            if let Some(tunnel) = ctx.take_tunnel() {
                tunnel.abort();
            }
        }
    }

    conn_monitor.close();
    flusher.abort();
    guard.release();
}

async fn serve_io<S>(
    io: S,
    engine: Arc<SessionEngine>,
    peer: SocketAddr,
    ctx: Arc<ConnContext>,
) -> Result<(), hyper::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let engine = engine.clone();
        let ctx = ctx.clone();
        async move { engine.handle(req, peer, ctx).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
}
