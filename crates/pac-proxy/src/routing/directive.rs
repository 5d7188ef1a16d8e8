//! Parsing of `FindProxyForURL` return values.
//!
//! A PAC decision is a `;`-separated list of candidates such as
//! `"PROXY cache:3128; SOCKS5 10.0.0.1:1080; DIRECT"`. Only the first
//! candidate is honoured; fallbacks are dropped because a session makes a
//! single upstream attempt.

use std::fmt;

/// Which kind of next hop a directive names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectiveKind {
    Direct,
    HttpProxy,
    Socks5Proxy,
    Invalid,
}

impl DirectiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectiveKind::Direct => "direct",
            DirectiveKind::HttpProxy => "http-proxy",
            DirectiveKind::Socks5Proxy => "socks5-proxy",
            DirectiveKind::Invalid => "invalid",
        }
    }
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of an upstream proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A parsed routing decision. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    kind: DirectiveKind,
    proxy: Option<ProxyAddr>,
    raw: String,
}

impl Directive {
    /// Parse a decision string. Never fails: unrecognised input yields
    /// [`DirectiveKind::Invalid`] with the original text preserved.
    pub fn parse(decision: &str) -> Self {
        // Whitespace around and between tokens is separator, as in PAC lists.
        let candidate = decision.split(';').next().unwrap_or_default().trim();
        let mut tokens = candidate.split_whitespace();

        let (kind, addr) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some("DIRECT"), None, None) => return Self::direct(decision),
            (Some("HTTP" | "PROXY"), Some(addr), None) => (DirectiveKind::HttpProxy, addr),
            (Some("SOCKS5"), Some(addr), None) => (DirectiveKind::Socks5Proxy, addr),
            _ => return Self::invalid(decision),
        };

        match parse_addr(addr) {
            Some(proxy) => Self {
                kind,
                proxy: Some(proxy),
                raw: decision.to_string(),
            },
            None => Self::invalid(decision),
        }
    }

    fn direct(raw: &str) -> Self {
        Self {
            kind: DirectiveKind::Direct,
            proxy: None,
            raw: raw.to_string(),
        }
    }

    fn invalid(raw: &str) -> Self {
        Self {
            kind: DirectiveKind::Invalid,
            proxy: None,
            raw: raw.to_string(),
        }
    }

    pub fn kind(&self) -> DirectiveKind {
        self.kind
    }

    /// Upstream proxy address; `Some` exactly for `HttpProxy` and `Socks5Proxy`.
    pub fn proxy(&self) -> Option<&ProxyAddr> {
        self.proxy.as_ref()
    }

    pub fn host(&self) -> Option<&str> {
        self.proxy.as_ref().map(|p| p.host.as_str())
    }

    pub fn port(&self) -> Option<u16> {
        self.proxy.as_ref().map(|p| p.port)
    }

    /// The decision string exactly as the script returned it.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_invalid(&self) -> bool {
        self.kind == DirectiveKind::Invalid
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.proxy {
            Some(proxy) => write!(f, "{} {}", self.kind, proxy),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Split `host:port` on the last colon. Bracketed IPv6 hosts lose their brackets.
fn parse_addr(addr: &str) -> Option<ProxyAddr> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some(ProxyAddr {
        host: host.to_string(),
        port,
    })
}
