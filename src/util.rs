//! Small helpers shared across the proxy: scheme derivation, random
//! URL-safe identifiers and header hygiene for forwarded requests.

use axum::body::Body;
use axum::http::header::HeaderName;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use axum::response::IntoResponse;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Marker inserted by the listener so handlers can tell whether the
/// connection was TLS-terminated by us.
#[derive(Clone, Copy, Debug)]
pub struct SchemeHint {
    pub https: bool,
}

/// Derive the effective scheme of an inbound request: the listener's own
/// TLS termination wins, otherwise `X-Forwarded-Proto: https` is honored.
pub fn request_scheme<B>(req: &Request<B>) -> &'static str {
    if req
        .extensions()
        .get::<SchemeHint>()
        .map(|h| h.https)
        .unwrap_or(false)
    {
        return "https";
    }
    let forwarded = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("https"))
        .unwrap_or(false);
    if forwarded {
        "https"
    } else {
        "http"
    }
}

/// The `Host` of an inbound request, taken from the header with the URI
/// authority as fallback (HTTP/2 carries it there).
pub fn request_host<B>(req: &Request<B>) -> String {
    if let Some(host) = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
    {
        return host.to_string();
    }
    req.uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default()
}

/// `n` random bytes as unpadded URL-safe base64.
pub fn random_url_safe(n: usize) -> String {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Hop-by-hop headers are meaningful per connection and must not be
/// relayed to the upstream or back to the client (RFC 9110 §7.6.1).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by `Connection` are hop-by-hop as well.
    let named: Vec<HeaderName> = headers
        .get_all(axum::http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// A `302 Found` redirect. `axum::response::Redirect` issues 303/307, while
/// the OIDC flow and the session-gated admission both use the classic 302.
pub fn found(location: &str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(axum::http::header::LOCATION, location)
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// The stable answer for anything that goes wrong between us and the
/// upstream.
pub fn bad_gateway() -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )
        .body(Body::from("bad gateway"))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_url_safe_and_distinct() {
        let a = random_url_safe(16);
        let b = random_url_safe(16);
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        // 16 bytes -> 22 base64 chars without padding
        assert_eq!(a.len(), 22);
    }

    #[test]
    fn scheme_prefers_listener_hint() {
        let mut req = Request::builder().uri("/x").body(()).unwrap();
        assert_eq!(request_scheme(&req), "http");
        req.extensions_mut().insert(SchemeHint { https: true });
        assert_eq!(request_scheme(&req), "https");
    }

    #[test]
    fn scheme_honors_forwarded_proto() {
        let req = Request::builder()
            .uri("/x")
            .header("x-forwarded-proto", "HTTPS")
            .body(())
            .unwrap();
        assert_eq!(request_scheme(&req), "https");
    }

    #[test]
    fn strips_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "x-custom-hop".parse().unwrap());
        headers.insert("x-custom-hop", "1".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("x-keep", "yes".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert!(headers.get("x-custom-hop").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("connection").is_none());
        assert_eq!(headers.get("x-keep").unwrap(), "yes");
    }
}
