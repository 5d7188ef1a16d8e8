//! Dispatch of inbound requests to sessions.

use super::context::ProxyContext;
use super::forwarding::{is_script_path, script_response, ProxyBody};
use super::session::TunnelSession;
use super::socket_group::SocketHandle;
use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::debug;

/// Handle one request arriving on a client connection.
///
/// `CONNECT` opens a tunnel session. Origin-form requests for a `.pac` or
/// `.dat` path are answered with the routing script itself. Everything else
/// is forwarded.
pub async fn handle_request(
    ctx: Arc<ProxyContext>,
    client: Arc<SocketHandle>,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
    debug!("Received request: {} {}", req.method(), req.uri());

    if req.method() == Method::CONNECT {
        return Ok(TunnelSession::new(ctx, client).tunnel(req).await);
    }

    if req.uri().authority().is_none() && is_script_path(req.uri().path()) {
        debug!("Serving routing script for {}", req.uri().path());
        return Ok(script_response(&ctx.engine.script()));
    }

    Ok(TunnelSession::new(ctx, client).forward(req).await)
}
