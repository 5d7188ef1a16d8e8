//! Opening the upstream link a routing directive asks for.
//!
//! The connector only establishes byte streams: a raw TCP connection for
//! `Direct` and for plain requests through an HTTP proxy, a `CONNECT` tunnel
//! through an HTTP proxy for tunnel sessions, and a no-auth SOCKS5 channel for
//! `Socks5Proxy`. Request rewriting and piping belong to the session.

use super::session::{SessionMode, SessionTarget};
use crate::error::{ConnectError, ConnectStage};
use crate::routing::{Directive, DirectiveKind, ProxyAddr};
use bytes::Bytes;
use http_body_util::Empty;
use hyper::{header, Method, Request};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

/// Any duplex byte stream an upstream link can hand back.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// An established connection to the next hop.
pub struct UpstreamLink {
    kind: DirectiveKind,
    next_hop: String,
    stream: BoxedStream,
}

impl UpstreamLink {
    pub fn kind(&self) -> DirectiveKind {
        self.kind
    }

    /// `host:port` of the first hop actually dialed.
    pub fn next_hop(&self) -> &str {
        &self.next_hop
    }

    pub fn into_stream(self) -> BoxedStream {
        self.stream
    }
}

impl std::fmt::Debug for UpstreamLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamLink")
            .field("kind", &self.kind)
            .field("next_hop", &self.next_hop)
            .finish_non_exhaustive()
    }
}

/// Dials upstream links. One instance is shared by every session.
#[derive(Debug, Default)]
pub struct UpstreamConnector {
    socks: Socks5AgentCache,
}

impl UpstreamConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn socks_agents(&self) -> &Socks5AgentCache {
        &self.socks
    }

    /// Open the link `directive` names for `target`.
    ///
    /// Single attempt: no fallback candidates and no retry. A failure at any
    /// stage drops whatever was already opened before returning.
    pub async fn connect(
        &self,
        target: &SessionTarget,
        directive: &Directive,
    ) -> Result<UpstreamLink, ConnectError> {
        let proxy = match (directive.kind(), directive.proxy()) {
            (DirectiveKind::Direct, _) => {
                return self.connect_direct(target).await;
            }
            (DirectiveKind::HttpProxy, Some(proxy)) => proxy,
            (DirectiveKind::Socks5Proxy, Some(proxy)) => {
                let agent = self.socks.agent(proxy);
                let stream = agent.connect(target).await?;
                return Ok(UpstreamLink {
                    kind: DirectiveKind::Socks5Proxy,
                    next_hop: proxy.to_string(),
                    stream: Box::new(stream),
                });
            }
            _ => return Err(ConnectError::Unroutable(directive.raw().to_string())),
        };

        let next_hop = proxy.to_string();
        let addrs = resolve(target, &next_hop, &proxy.host, proxy.port).await?;
        let tcp = dial(target, &next_hop, &addrs).await?;
        let stream: BoxedStream = match target.mode() {
            SessionMode::Forward => Box::new(tcp),
            SessionMode::Tunnel => Box::new(proxy_connect(target, &next_hop, tcp).await?),
        };
        Ok(UpstreamLink {
            kind: DirectiveKind::HttpProxy,
            next_hop,
            stream,
        })
    }

    async fn connect_direct(&self, target: &SessionTarget) -> Result<UpstreamLink, ConnectError> {
        let next_hop = target.authority();
        let addrs = resolve(target, &next_hop, target.host(), target.port()).await?;
        let tcp = dial(target, &next_hop, &addrs).await?;
        Ok(UpstreamLink {
            kind: DirectiveKind::Direct,
            next_hop,
            stream: Box::new(tcp),
        })
    }
}

async fn resolve(
    target: &SessionTarget,
    next_hop: &str,
    host: &str,
    port: u16,
) -> Result<Vec<SocketAddr>, ConnectError> {
    let fail =
        |e: io::Error| ConnectError::failed(target.authority(), next_hop, ConnectStage::Resolve, e);
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await.map_err(fail)?.collect();
    if addrs.is_empty() {
        return Err(fail(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {host}"),
        )));
    }
    Ok(addrs)
}

/// Try each resolved address in order, returning the first connection.
async fn dial(
    target: &SessionTarget,
    next_hop: &str,
    addrs: &[SocketAddr],
) -> Result<TcpStream, ConnectError> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay on {} failed: {}", addr, e);
                }
                return Ok(stream);
            }
            Err(e) => {
                debug!("connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    let err = last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses to dial"));
    Err(ConnectError::failed(
        target.authority(),
        next_hop,
        ConnectStage::Tcp,
        err,
    ))
}

/// Ask an HTTP proxy to open a tunnel to `target` over `tcp`.
async fn proxy_connect(
    target: &SessionTarget,
    next_hop: &str,
    tcp: TcpStream,
) -> Result<TokioIo<hyper::upgrade::Upgraded>, ConnectError> {
    let authority = target.authority();
    let fail = |e: io::Error| {
        ConnectError::failed(authority.clone(), next_hop, ConnectStage::ProxyConnect, e)
    };

    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .handshake(TokioIo::new(tcp))
        .await
        .map_err(|e| fail(io::Error::other(e)))?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("proxy CONNECT connection ended: {}", e);
        }
    });

    let req = Request::builder()
        .method(Method::CONNECT)
        .uri(authority.as_str())
        .header(header::HOST, authority.as_str())
        .body(Empty::<Bytes>::new())
        .map_err(|e| fail(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    let res = sender
        .send_request(req)
        .await
        .map_err(|e| fail(io::Error::other(e)))?;
    if !res.status().is_success() {
        return Err(fail(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy answered {}", res.status()),
        )));
    }

    let upgraded = hyper::upgrade::on(res)
        .await
        .map_err(|e| fail(io::Error::other(e)))?;
    Ok(TokioIo::new(upgraded))
}

/// Reusable state for one SOCKS5 upstream proxy.
///
/// The proxy's hostname is resolved again for every channel, so a proxy
/// that moves to a new address is picked up without a restart.
#[derive(Debug)]
pub struct Socks5Agent {
    proxy: ProxyAddr,
    connections: AtomicU64,
}

impl Socks5Agent {
    fn new(proxy: ProxyAddr) -> Self {
        Self {
            proxy,
            connections: AtomicU64::new(0),
        }
    }

    pub fn proxy(&self) -> &ProxyAddr {
        &self.proxy
    }

    /// Number of channels opened through this agent so far.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    async fn connect(
        &self,
        target: &SessionTarget,
    ) -> Result<Socks5Stream<TcpStream>, ConnectError> {
        let next_hop = self.proxy.to_string();
        let addrs = resolve(target, &next_hop, &self.proxy.host, self.proxy.port).await?;
        let tcp = dial(target, &next_hop, &addrs).await?;

        let stream = Socks5Stream::connect_with_socket(tcp, (target.host(), target.port()))
            .await
            .map_err(|e| {
                ConnectError::failed(
                    target.authority(),
                    next_hop.as_str(),
                    ConnectStage::Socks5Handshake,
                    io::Error::other(e),
                )
            })?;
        self.connections.fetch_add(1, Ordering::Relaxed);
        Ok(stream)
    }
}

/// Process-wide SOCKS5 agents keyed by `"host:port"`.
#[derive(Debug, Default)]
pub struct Socks5AgentCache {
    agents: Mutex<HashMap<String, Arc<Socks5Agent>>>,
}

impl Socks5AgentCache {
    /// Fetch the agent for `proxy`, creating it on first use.
    pub fn agent(&self, proxy: &ProxyAddr) -> Arc<Socks5Agent> {
        let key = proxy.to_string();
        let mut agents = self.agents.lock();
        agents
            .entry(key)
            .or_insert_with(|| {
                debug!("creating SOCKS5 agent for {}", proxy);
                Arc::new(Socks5Agent::new(proxy.clone()))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn connect_target(authority: &str) -> SessionTarget {
        SessionTarget::for_connect(&authority.parse().unwrap()).unwrap()
    }

    fn forward_target(url: &str) -> SessionTarget {
        SessionTarget::for_request(&url.parse().unwrap(), &hyper::HeaderMap::new()).unwrap()
    }

    /// A port nothing listens on.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if stream.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8_lossy(&head).into_owned()
    }

    #[tokio::test]
    async fn test_invalid_directive_is_unroutable() {
        let connector = UpstreamConnector::new();
        let target = forward_target("http://example.com/");
        let err = connector
            .connect(&target, &Directive::parse("BOGUS"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Unroutable(ref raw) if raw == "BOGUS"));
        assert!(connector.socks_agents().is_empty());
    }

    #[tokio::test]
    async fn test_direct_connects_to_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let connector = UpstreamConnector::new();
        let target = forward_target(&format!("http://127.0.0.1:{port}/"));
        let link = connector
            .connect(&target, &Directive::parse("DIRECT"))
            .await
            .unwrap();
        assert_eq!(link.kind(), DirectiveKind::Direct);
        assert_eq!(link.next_hop(), format!("127.0.0.1:{port}"));

        let mut stream = link.into_stream();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_reports_tcp_stage() {
        let port = closed_port().await;
        let connector = UpstreamConnector::new();
        let target = forward_target(&format!("http://127.0.0.1:{port}/"));
        let err = connector
            .connect(&target, &Directive::parse("DIRECT"))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(ConnectStage::Tcp));
    }

    #[tokio::test]
    async fn test_http_proxy_connect_tunnel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let proxy = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let head = read_head(&mut socket).await;
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
            head
        });

        let connector = UpstreamConnector::new();
        let target = connect_target("example.com:443");
        let link = connector
            .connect(&target, &Directive::parse(&format!("PROXY 127.0.0.1:{port}")))
            .await
            .unwrap();
        assert_eq!(link.kind(), DirectiveKind::HttpProxy);

        let mut stream = link.into_stream();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let head = proxy.await.unwrap();
        assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"), "{head}");
    }

    #[tokio::test]
    async fn test_http_proxy_rejection_reports_proxy_connect_stage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_head(&mut socket).await;
            socket
                .write_all(b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let connector = UpstreamConnector::new();
        let target = connect_target("example.com:443");
        let err = connector
            .connect(&target, &Directive::parse(&format!("HTTP 127.0.0.1:{port}")))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(ConnectStage::ProxyConnect));
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn test_http_proxy_forward_mode_is_plain_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let proxy = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let connector = UpstreamConnector::new();
        let target = forward_target("http://example.com/");
        let link = connector
            .connect(&target, &Directive::parse(&format!("PROXY 127.0.0.1:{port}")))
            .await
            .unwrap();
        let mut stream = link.into_stream();
        stream.write_all(b"GET").await.unwrap();
        assert_eq!(&proxy.await.unwrap(), b"GET");
    }

    #[tokio::test]
    async fn test_socks5_handshake_failure_reports_stage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            let _ = socket.read_exact(&mut greeting).await;
            // Not a SOCKS5 server: pick an unsupported method.
            let _ = socket.write_all(&[0x05, 0xff]).await;
        });

        let connector = UpstreamConnector::new();
        let target = connect_target("example.com:443");
        let err = connector
            .connect(&target, &Directive::parse(&format!("SOCKS5 127.0.0.1:{port}")))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(ConnectStage::Socks5Handshake));
        assert_eq!(connector.socks_agents().len(), 1);
    }

    /// Minimal no-auth SOCKS5 server: answers one handshake, then echoes.
    async fn serve_socks5(listener: TcpListener) {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut greeting = [0u8; 2];
                socket.read_exact(&mut greeting).await.unwrap();
                let mut methods = vec![0u8; greeting[1] as usize];
                socket.read_exact(&mut methods).await.unwrap();
                socket.write_all(&[0x05, 0x00]).await.unwrap();

                let mut request = [0u8; 4];
                socket.read_exact(&mut request).await.unwrap();
                assert_eq!(request[3], 0x03);
                let len = socket.read_u8().await.unwrap() as usize;
                let mut rest = vec![0u8; len + 2];
                socket.read_exact(&mut rest).await.unwrap();
                socket
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();

                let mut buf = [0u8; 1];
                while socket.read(&mut buf).await.unwrap_or(0) == 1 {
                    socket.write_all(&buf).await.unwrap();
                }
            });
        }
    }

    #[tokio::test]
    async fn test_socks5_agent_survives_proxy_restart() {
        let port = closed_port().await;
        let connector = UpstreamConnector::new();
        let directive = Directive::parse(&format!("SOCKS5 localhost:{port}"));
        let target = connect_target("example.com:443");

        let err = connector.connect(&target, &directive).await.unwrap_err();
        assert_eq!(err.stage(), Some(ConnectStage::Tcp));

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::spawn(serve_socks5(listener));

        for _ in 0..2 {
            let link = connector.connect(&target, &directive).await.unwrap();
            assert_eq!(link.kind(), DirectiveKind::Socks5Proxy);
            assert_eq!(link.next_hop(), format!("localhost:{port}"));
            let mut stream = link.into_stream();
            stream.write_all(b"z").await.unwrap();
            let mut buf = [0u8; 1];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"z");
        }

        assert_eq!(connector.socks_agents().len(), 1);
        let agent = connector.socks_agents().agent(directive.proxy().unwrap());
        assert_eq!(agent.connections(), 2);
    }

    #[test]
    fn test_agent_cache_reuses_agents() {
        let cache = Socks5AgentCache::default();
        let a = ProxyAddr {
            host: "127.0.0.1".to_string(),
            port: 1080,
        };
        let b = ProxyAddr {
            host: "127.0.0.1".to_string(),
            port: 1081,
        };

        let first = cache.agent(&a);
        let again = cache.agent(&a);
        assert!(Arc::ptr_eq(&first, &again));

        let other = cache.agent(&b);
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(cache.len(), 2);
        assert_eq!(first.proxy(), &a);
        assert_eq!(first.connections(), 0);
    }
}
