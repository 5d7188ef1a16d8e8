//! One proxied request, from target resolution to teardown.

use super::context::ProxyContext;
use super::connector::BoxedStream;
use super::forwarding::{connection_established, error_response, rewrite_for_upstream, ProxyBody};
use super::socket_group::{GroupedStream, SocketGroup, SocketHandle};
use crate::error::{RouteError, SessionError, TargetError};
use crate::routing::{Directive, DirectiveKind};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, HOST};
use hyper::http::uri::Authority;
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// How the upstream link will be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// A plain HTTP request relayed as one request/response exchange.
    Forward,
    /// A CONNECT request relayed as raw bytes.
    Tunnel,
}

/// The resolved identity of the request being proxied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    url: String,
    host: String,
    port: u16,
    mode: SessionMode,
}

impl SessionTarget {
    /// Resolve a plain request. Origin-form targets fall back to the `Host`
    /// header; the scheme defaults to `http` and the port to 80.
    pub fn for_request(uri: &Uri, headers: &HeaderMap) -> Result<Self, TargetError> {
        if let Some(scheme) = uri.scheme_str() {
            if !scheme.eq_ignore_ascii_case("http") {
                return Err(TargetError::UnsupportedScheme(scheme.to_string()));
            }
        }

        let authority = match uri.authority() {
            Some(authority) => authority.clone(),
            None => {
                let host = headers
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| !v.is_empty())
                    .ok_or(TargetError::MissingHost)?;
                host.parse::<Authority>()
                    .map_err(|_| TargetError::InvalidAuthority(host.to_string()))?
            }
        };

        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let (host, port) = split_authority(&authority, 80)?;
        Ok(Self {
            url: format!("http://{authority}{path}"),
            host,
            port,
            mode: SessionMode::Forward,
        })
    }

    /// Resolve a CONNECT request target (`host:port`, port defaulting to 443).
    pub fn for_connect(uri: &Uri) -> Result<Self, TargetError> {
        let authority = uri.authority().ok_or(TargetError::MissingHost)?;
        let (host, port) = split_authority(authority, 443)?;
        Ok(Self {
            url: format!("https://{authority}"),
            host,
            port,
            mode: SessionMode::Tunnel,
        })
    }

    /// The absolute URL handed to the routing script.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Hostname without brackets or port.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn split_authority(authority: &Authority, default_port: u16) -> Result<(String, u16), TargetError> {
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']');
    if host.is_empty() {
        return Err(TargetError::InvalidAuthority(authority.to_string()));
    }
    Ok((host.to_string(), authority.port_u16().unwrap_or(default_port)))
}

/// Lifecycle of a session. Errors jump straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Resolving,
    Deciding,
    Connecting,
    Tunneling,
    Closed,
}

impl SessionState {
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Resolving, Deciding)
                | (Deciding, Connecting)
                | (Connecting, Tunneling)
                | (Resolving | Deciding | Connecting | Tunneling, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Resolving => "resolving",
            SessionState::Deciding => "deciding",
            SessionState::Connecting => "connecting",
            SessionState::Tunneling => "tunneling",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Drives one request through decide, connect and relay.
///
/// Every socket the session touches joins its [`SocketGroup`]: the client
/// connection up front, the upstream link once connected, and the upgraded
/// client stream for tunnels. A failure on any of them after tunneling starts
/// tears down all of them. Failures before that point become an error
/// response instead.
pub struct TunnelSession {
    id: u64,
    ctx: Arc<ProxyContext>,
    group: SocketGroup,
    state: SessionState,
    label: String,
}

impl TunnelSession {
    pub fn new(ctx: Arc<ProxyContext>, client: Arc<SocketHandle>) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let group = SocketGroup::new(format!("session {id}"));
        group.register(client);
        Self {
            id,
            ctx,
            group,
            state: SessionState::Resolving,
            label: format!("session {id}"),
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "{} -> {}",
            self.state,
            next
        );
        debug!("{}: {} -> {}", self.label, self.state, next);
        self.state = next;
    }

    /// Relay a plain HTTP request and return the upstream response.
    pub async fn forward(mut self, req: Request<Incoming>) -> Response<ProxyBody> {
        match self.try_forward(req).await {
            Ok(response) => response,
            Err(e) => self.reject(e, false),
        }
    }

    async fn try_forward(
        &mut self,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, SessionError> {
        let target = SessionTarget::for_request(req.uri(), req.headers())?;
        let directive = self.decide(&target)?;
        self.advance(SessionState::Connecting);
        let link = self.ctx.connector.connect(&target, &directive).await?;
        let kind = link.kind();
        self.advance(SessionState::Tunneling);

        let upstream = GroupedStream::register(&self.group, "upstream", link.into_stream());
        let req = rewrite_for_upstream(req, &target, kind);

        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(upstream))
            .await?;
        let group = self.group.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                group.fail("upstream connection", &e);
            }
        });

        let response = sender.send_request(req).await?;
        debug!(
            "{}: {} answered {}",
            self.label,
            target.authority(),
            response.status()
        );
        Ok(response.map(|body| body.boxed()))
    }

    /// Answer a CONNECT request and, on success, pipe raw bytes in the
    /// background once the client connection is upgraded.
    pub async fn tunnel(mut self, req: Request<Incoming>) -> Response<ProxyBody> {
        let upstream = match self.open_tunnel(&req).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let mut response = self.reject(e, true);
                response
                    .headers_mut()
                    .insert(CONNECTION, HeaderValue::from_static("close"));
                return response;
            }
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => self.pipe(TokioIo::new(upgraded), upstream).await,
                Err(e) => {
                    self.group.fail("client upgrade", &e);
                    self.advance(SessionState::Closed);
                }
            }
        });
        connection_established()
    }

    async fn open_tunnel(
        &mut self,
        req: &Request<Incoming>,
    ) -> Result<GroupedStream<BoxedStream>, SessionError> {
        let target = SessionTarget::for_connect(req.uri())?;
        let directive = self.decide(&target)?;
        self.advance(SessionState::Connecting);
        let link = self.ctx.connector.connect(&target, &directive).await?;
        debug!(
            "{}: tunnel to {} via {} ({})",
            self.label,
            target.authority(),
            link.next_hop(),
            link.kind()
        );
        self.advance(SessionState::Tunneling);
        Ok(GroupedStream::register(
            &self.group,
            "upstream",
            link.into_stream(),
        ))
    }

    async fn pipe(
        mut self,
        client: TokioIo<hyper::upgrade::Upgraded>,
        mut upstream: GroupedStream<BoxedStream>,
    ) {
        let mut client = GroupedStream::register(&self.group, "client tunnel", client);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => {
                debug!(
                    "{}: tunnel closed, {} bytes up, {} bytes down",
                    self.label, sent, received
                );
                self.group.close();
            }
            Err(e) => self.group.fail("tunnel", &e),
        }
        self.advance(SessionState::Closed);
    }

    fn decide(&mut self, target: &SessionTarget) -> Result<Directive, RouteError> {
        self.advance(SessionState::Deciding);
        let directive = self.ctx.engine.decide(target.url(), target.host())?;
        if directive.kind() == DirectiveKind::Invalid {
            return Err(RouteError::Unroutable(directive.raw().to_string()));
        }
        Ok(directive)
    }

    /// Turn a failure into the response the client sees.
    fn reject(&mut self, err: SessionError, tunnel: bool) -> Response<ProxyBody> {
        if self.state == SessionState::Tunneling {
            // The exchange already started; peers are torn down with the group.
            warn!("{}: upstream exchange failed: {}", self.label, err);
        } else {
            warn!(
                "{}: {} failed while {}: {}",
                self.label,
                if tunnel { "CONNECT" } else { "request" },
                self.state,
                err
            );
        }
        self.advance(SessionState::Closed);
        error_response(err.status(), &err.to_string())
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("group", &self.group)
            .finish()
    }
}
