//! A forward HTTP proxy that picks the next hop for every request by running
//! a PAC (proxy auto-config) script.
//!
//! Plain requests are relayed as HTTP exchanges; `CONNECT` requests become
//! raw tunnels. The script decides between going direct, through an HTTP
//! proxy, or through a SOCKS5 proxy, and is reloaded when its file changes.

pub mod config;
pub mod error;
pub mod proxy;
pub mod routing;
pub mod scripting;
