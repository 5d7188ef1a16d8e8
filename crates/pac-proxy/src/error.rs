//! Error taxonomy for routing decisions, upstream connections and sessions.

use std::fmt;
use std::io;

/// Failure to load, compile, or run a routing script.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("failed to read routing script {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("routing script failed to compile: {0}")]
    Compile(String),
    #[error("routing script does not define a callable {0}")]
    MissingEntryPoint(&'static str),
    #[error("routing script threw: {0}")]
    Execution(String),
    #[error("routing script returned a non-string value: {0}")]
    NonStringResult(String),
}

/// Why a routing decision could not produce a usable next hop.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// The decision function itself failed to run.
    #[error(transparent)]
    ScriptExecution(#[from] ScriptError),
    /// The decision function ran but its answer matched no known syntax.
    #[error("unroutable directive: {0:?}")]
    Unroutable(String),
}

/// The step of upstream connection establishment that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    Resolve,
    Tcp,
    ProxyConnect,
    Socks5Handshake,
}

impl ConnectStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectStage::Resolve => "resolve",
            ConnectStage::Tcp => "tcp connect",
            ConnectStage::ProxyConnect => "proxy CONNECT",
            ConnectStage::Socks5Handshake => "socks5 handshake",
        }
    }
}

impl fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to open the upstream link for a session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("{stage} to {next_hop} failed while reaching {target}: {source}")]
    Failed {
        target: String,
        next_hop: String,
        stage: ConnectStage,
        #[source]
        source: io::Error,
    },
    /// The directive was `Invalid`; no connection was attempted.
    #[error("unroutable directive: {0:?}")]
    Unroutable(String),
}

impl ConnectError {
    pub(crate) fn failed(
        target: impl Into<String>,
        next_hop: impl Into<String>,
        stage: ConnectStage,
        source: io::Error,
    ) -> Self {
        ConnectError::Failed {
            target: target.into(),
            next_hop: next_hop.into(),
            stage,
            source,
        }
    }

    pub fn stage(&self) -> Option<ConnectStage> {
        match self {
            ConnectError::Failed { stage, .. } => Some(*stage),
            ConnectError::Unroutable(_) => None,
        }
    }
}

/// The inbound request does not name a reachable target.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("request has no authority and no Host header")]
    MissingHost,
    #[error("invalid target authority: {0:?}")]
    InvalidAuthority(String),
    #[error("unsupported scheme for plain forwarding: {0}")]
    UnsupportedScheme(String),
}

/// Everything that can end a session before or during tunneling.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("upstream exchange failed: {0}")]
    Upstream(#[from] hyper::Error),
}

impl SessionError {
    /// Status sent to the client when the failure happens before tunneling.
    pub fn status(&self) -> hyper::StatusCode {
        match self {
            SessionError::Target(_) => hyper::StatusCode::BAD_REQUEST,
            _ => hyper::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
