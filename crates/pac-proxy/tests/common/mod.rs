//! In-process fixtures for driving a real proxy: origins, an HTTP proxy
//! stand-in, a no-auth SOCKS5 server and an echo server.

#![allow(dead_code)]

use pac_proxy::config::Config;
use pac_proxy::proxy::ProxyServer;
use pac_proxy::routing::RoutingEngine;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A proxy serving `script` on an ephemeral localhost port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub script_path: PathBuf,
    pub engine: Arc<RoutingEngine>,
    _dir: TempDir,
    task: JoinHandle<()>,
}

impl TestProxy {
    pub async fn start(script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("proxy.pac");
        std::fs::write(&script_path, script).unwrap();

        let mut config = Config::new(&script_path);
        config.listen.host = "127.0.0.1".to_string();
        config.listen.port = 0;
        config.script.reload_interval_ms = 50;

        let server = ProxyServer::bind(&config).await.unwrap();
        let addr = server.local_addr();
        let engine = server.engine().clone();
        let task = tokio::spawn(async move {
            server.run().await.unwrap();
        });

        Self {
            addr,
            script_path,
            engine,
            _dir: dir,
            task,
        }
    }

    /// An HTTP client that sends every request through this proxy.
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::http(format!("http://{}", self.addr)).unwrap())
            .build()
            .unwrap()
    }

    pub fn rewrite_script(&self, script: &str) {
        std::fs::write(&self.script_path, script).unwrap();
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Script that answers every request with `directive`.
pub fn constant_script(directive: &str) -> String {
    format!("function FindProxyForURL(url, host) {{ return \"{directive}\"; }}")
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Read up to and including the blank line ending an HTTP head.
pub async fn read_head<R: AsyncRead + Unpin>(stream: &mut R) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Send `request` on a fresh connection and return everything read back.
pub async fn send_raw(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;
    String::from_utf8_lossy(&response).into_owned()
}

/// An HTTP/1.1 server answering one request per connection with a fixed
/// body, recording each request head. Doubles as an upstream HTTP proxy.
pub struct HttpFixture {
    pub addr: SocketAddr,
    heads: Arc<Mutex<Vec<String>>>,
    accepts: Arc<AtomicUsize>,
}

impl HttpFixture {
    pub async fn start(body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let heads = Arc::new(Mutex::new(Vec::new()));
        let accepts = Arc::new(AtomicUsize::new(0));

        let (task_heads, task_accepts) = (heads.clone(), accepts.clone());
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                task_accepts.fetch_add(1, Ordering::SeqCst);
                let heads = task_heads.clone();
                tokio::spawn(async move {
                    let head = read_head(&mut socket).await;
                    heads.lock().push(head);
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Origin: fixture\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self {
            addr,
            heads,
            accepts,
        }
    }

    pub fn heads(&self) -> Vec<String> {
        self.heads.lock().clone()
    }

    /// First line of every request received so far.
    pub fn request_lines(&self) -> Vec<String> {
        self.heads()
            .iter()
            .map(|head| head.lines().next().unwrap_or_default().to_string())
            .collect()
    }

    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

/// Echoes every byte back until the client closes.
pub async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// A no-auth SOCKS5 server that records requested targets and relays every
/// accepted channel to `backend`.
pub struct Socks5Fixture {
    pub addr: SocketAddr,
    targets: Arc<Mutex<Vec<String>>>,
}

impl Socks5Fixture {
    pub async fn start(backend: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let targets = Arc::new(Mutex::new(Vec::new()));

        let task_targets = targets.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let targets = task_targets.clone();
                tokio::spawn(async move {
                    if let Ok((socket, target)) = socks5_accept(socket).await {
                        targets.lock().push(target);
                        if let Ok(upstream) = TcpStream::connect(backend).await {
                            let (mut socket, mut upstream) = (socket, upstream);
                            let _ =
                                tokio::io::copy_bidirectional(&mut socket, &mut upstream).await;
                        }
                    }
                });
            }
        });

        Self { addr, targets }
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().clone()
    }
}

async fn socks5_accept(mut socket: TcpStream) -> std::io::Result<(TcpStream, String)> {
    let mut greeting = [0u8; 2];
    socket.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    socket.read_exact(&mut methods).await?;
    socket.write_all(&[0x05, 0x00]).await?;

    let mut request = [0u8; 4];
    socket.read_exact(&mut request).await?;
    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            socket.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let len = socket.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            socket.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        _ => {
            let mut ip = [0u8; 16];
            socket.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
    };
    let port = socket.read_u16().await?;
    socket
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok((socket, format!("{host}:{port}")))
}
