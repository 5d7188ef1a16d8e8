//! ProxyServer struct and main run loop.
//!
//! The server owns the listening socket and the process-wide proxy context.
//! Each accepted connection is served as HTTP/1.1 with upgrades enabled so
//! that CONNECT requests can be turned into raw tunnels.

use super::context::ProxyContext;
use super::handler::handle_request;
use super::network::create_listener;
use super::socket_group::SocketHandle;
use crate::config::Config;
use crate::routing::{spawn_reload_watcher, RoutingEngine};
use anyhow::Context;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Pause after a failed accept so resource exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// The main proxy server struct.
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    reload_interval: Duration,
}

impl ProxyServer {
    /// Load the routing script and bind the listener.
    ///
    /// Fails if the script cannot be loaded: without a first good version
    /// there is nothing to fall back on.
    pub async fn bind(config: &Config) -> Result<Self, anyhow::Error> {
        config.validate()?;
        let engine = RoutingEngine::from_path(&config.script.path)
            .with_context(|| format!("failed to load {}", config.script.path.display()))?;

        let addr = config.listen_addr()?;
        let listener =
            create_listener(addr).with_context(|| format!("failed to listen on {addr}"))?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            ctx: Arc::new(ProxyContext::new(Arc::new(engine))),
            reload_interval: config.script.reload_interval(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn engine(&self) -> &Arc<RoutingEngine> {
        &self.ctx.engine
    }

    /// Run the proxy server until the process is stopped.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Sessions already in flight are not awaited.
    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), anyhow::Error> {
        let watcher = spawn_reload_watcher(self.ctx.engine.clone(), self.reload_interval);

        info!("Listening on http://{}", self.local_addr);
        info!(
            "Routing with {} (checked every {:?})",
            self.ctx.engine.describe_source(),
            self.reload_interval
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        tokio::spawn(serve_client(self.ctx.clone(), stream, remote_addr));
                    }
                    Err(err) => {
                        error!("Failed to accept connection: {}", err);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        watcher.abort();
        Ok(())
    }
}

/// Serve every request on one client connection.
///
/// The connection is dropped as soon as a session tears down its socket
/// group, even if hyper is still waiting on it.
async fn serve_client(ctx: Arc<ProxyContext>, stream: TcpStream, remote_addr: SocketAddr) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!("set_nodelay for {} failed: {}", remote_addr, err);
    }

    let client = SocketHandle::new("client");
    let service = {
        let client = client.clone();
        service_fn(move |req| handle_request(ctx.clone(), client.clone(), req))
    };

    let connection = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();

    tokio::select! {
        result = connection => {
            if let Err(err) = result {
                debug!("Error serving connection from {}: {}", remote_addr, err);
            }
        }
        _ = client.destroyed() => {
            debug!("Connection from {} closed by session teardown", remote_addr);
        }
    }
}
