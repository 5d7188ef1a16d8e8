//! Request rewriting and locally generated responses.

use super::session::SessionTarget;
use crate::routing::DirectiveKind;
use crate::scripting::PacScript;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use hyper::http::uri::PathAndQuery;
use hyper::{Request, Response, StatusCode, Uri};
use std::convert::Infallible;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Content type browsers expect for proxy auto-config files.
pub const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

/// Path suffixes under which the routing script is served.
const SCRIPT_SUFFIXES: [&str; 2] = [".pac", ".dat"];

static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

/// Plain-text error response carrying the failure description.
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full(format!("{message}\n")));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// `200 Connection established`, sent before a tunnel starts relaying.
pub fn connection_established() -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"Connection established"));
    response
}

pub fn is_script_path(path: &str) -> bool {
    SCRIPT_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}

/// Serve the currently loaded routing script.
pub fn script_response(script: &PacScript) -> Response<ProxyBody> {
    let mut response = Response::new(full(script.source().to_string()));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(PAC_CONTENT_TYPE));
    response
}

/// Prepare a client request for the upstream link.
///
/// HTTP proxies get the absolute URI; origins reached directly or through
/// SOCKS5 get origin-form. Method, headers and body pass through, apart from
/// the non-standard `Proxy-Connection` header meant for this hop.
pub fn rewrite_for_upstream<B>(
    req: Request<B>,
    target: &SessionTarget,
    kind: DirectiveKind,
) -> Request<B> {
    let (mut parts, body) = req.into_parts();

    parts.uri = match kind {
        DirectiveKind::HttpProxy => target.url().parse().unwrap_or(parts.uri),
        _ => Uri::from(
            parts
                .uri
                .path_and_query()
                .cloned()
                .unwrap_or_else(|| PathAndQuery::from_static("/")),
        ),
    };

    parts.headers.remove(&PROXY_CONNECTION);
    if !parts.headers.contains_key(HOST) {
        if let Ok(host) = HeaderValue::from_str(&host_header(target)) {
            parts.headers.insert(HOST, host);
        }
    }

    Request::from_parts(parts, body)
}

/// `Host` value for `target`, omitting the default port.
fn host_header(target: &SessionTarget) -> String {
    if target.port() == 80 {
        if target.host().contains(':') {
            format!("[{}]", target.host())
        } else {
            target.host().to_string()
        }
    } else {
        target.authority()
    }
}
