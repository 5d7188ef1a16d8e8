//! Proxy server module.
//!
//! # Module Structure
//!
//! - `server` - ProxyServer struct and accept loop
//! - `handler` - dispatch of inbound requests to sessions
//! - `session` - per-request state machine (resolve, decide, connect, relay)
//! - `connector` - upstream links: direct, HTTP proxy, SOCKS5
//! - `socket_group` - fault correlation across a session's sockets
//! - `forwarding` - request rewriting and locally generated responses
//! - `network` - listener setup

mod connector;
mod context;
mod forwarding;
mod handler;
mod network;
mod server;
mod session;
mod socket_group;

pub use connector::{Socks5Agent, Socks5AgentCache, UpstreamConnector, UpstreamLink};
pub use context::ProxyContext;
pub use forwarding::PAC_CONTENT_TYPE;
pub use server::ProxyServer;
pub use session::{SessionMode, SessionState, SessionTarget, TunnelSession};
pub use socket_group::{Endpoint, GroupedStream, SocketGroup, SocketHandle};
