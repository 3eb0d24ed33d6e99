//! Request context for inspection
//!
//! [`RequestContext`] is the firewall's view of one request: the immutable
//! header-side fields captured before phase 1, the buffered body attached
//! before phase 2, and the response side attached before phases 3 and 4.
//! All extraction targets resolve against this struct, so the downstream
//! handler never observes a partially consumed request.

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

use crate::blacklist::IpSet;

/// Client IP derivation policy
///
/// `X-Forwarded-For` is only believed when the transport peer is a known
/// proxy; otherwise header values are attacker-controlled and the peer
/// address wins.
#[derive(Debug, Clone, Default)]
pub struct ClientIpPolicy {
    trusted_proxies: IpSet,
    has_proxies: bool,
}

impl ClientIpPolicy {
    /// Build the policy from configured proxy networks. Invalid entries are
    /// skipped; bare IPs cover the single host.
    pub fn new(trusted_proxies: &[String]) -> Self {
        let mut set = IpSet::new();
        let mut count = 0usize;
        for entry in trusted_proxies {
            match crate::blacklist::parse_entry(entry) {
                Ok(net) => {
                    set.insert(net);
                    count += 1;
                }
                Err(e) => {
                    tracing::warn!(entry = %entry, error = %e, "Skipping invalid trusted proxy");
                }
            }
        }
        Self {
            trusted_proxies: set,
            has_proxies: count > 0,
        }
    }

    /// Derive the client address from the transport peer and headers.
    pub fn client_ip(&self, peer: SocketAddr, headers: &HeaderMap) -> IpAddr {
        let peer_ip = peer.ip();
        if !self.has_proxies || !self.trusted_proxies.contains(peer_ip) {
            return peer_ip;
        }

        // Walk X-Forwarded-For right to left: the first hop that is not one
        // of our proxies is the client. Entirely-trusted chains fall back to
        // the leftmost entry.
        let forwarded: Vec<IpAddr> = headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|part| part.trim().parse::<IpAddr>().ok())
            .collect();

        for candidate in forwarded.iter().rev() {
            if !self.trusted_proxies.contains(*candidate) {
                return *candidate;
            }
        }

        forwarded.first().copied().unwrap_or(peer_ip)
    }
}

/// The firewall's view of one request (and, later, its response)
#[derive(Debug)]
pub struct RequestContext {
    /// Uppercase HTTP method
    pub method: String,
    /// Full request target including query
    pub uri: String,
    /// Path component only
    pub path: String,
    /// Raw query string, empty if absent
    pub query: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Derived client address
    pub client_ip: IpAddr,

    /// Inspectable request body prefix; `None` until buffered
    body: Option<Bytes>,
    /// Whether the body exceeded the inspection cap
    pub body_truncated: bool,

    /// Response status once the downstream handler returned
    pub response_status: Option<u16>,
    /// Response headers for phase 3
    pub response_headers: Option<HeaderMap>,
    /// Response body for phase 4
    response_body: Option<Bytes>,
}

impl RequestContext {
    /// Capture the header-side view of a request.
    pub fn new(method: &Method, uri: &Uri, headers: HeaderMap, client_ip: IpAddr) -> Self {
        let path = uri.path().to_string();
        let query = uri.query().unwrap_or_default().to_string();
        Self {
            method: method.as_str().to_ascii_uppercase(),
            uri: uri.to_string(),
            path,
            query,
            headers,
            client_ip,
            body: None,
            body_truncated: false,
            response_status: None,
            response_headers: None,
            response_body: None,
        }
    }

    /// Attach the buffered request body before phase 2.
    pub fn set_body(&mut self, body: Bytes, truncated: bool) {
        if truncated {
            debug!(
                inspected = body.len(),
                "Request body exceeded inspection cap, rules evaluate on prefix"
            );
        }
        self.body = Some(body);
        self.body_truncated = truncated;
    }

    /// Whether the request body has been buffered yet.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// The inspectable body as text (lossy for non-UTF-8 payloads).
    pub fn body_text(&self) -> String {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    /// Attach the response header side before phase 3.
    pub fn set_response(&mut self, status: u16, headers: HeaderMap) {
        self.response_status = Some(status);
        self.response_headers = Some(headers);
    }

    /// Attach the response body before phase 4.
    pub fn set_response_body(&mut self, body: Bytes) {
        self.response_body = Some(body);
    }

    /// The response body as text, empty until phase 4.
    pub fn response_body_text(&self) -> String {
        self.response_body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    /// Single request header value, empty when absent.
    pub fn header(&self, name: &str) -> String {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    /// All request headers as `name: value` lines.
    pub fn headers_concat(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.headers {
            out.push_str(name.as_str());
            out.push_str(": ");
            out.push_str(value.to_str().unwrap_or_default());
            out.push('\n');
        }
        out
    }

    /// The raw `Cookie` header.
    pub fn cookies_raw(&self) -> String {
        self.header("cookie")
    }

    /// A single cookie value by name.
    pub fn cookie(&self, name: &str) -> String {
        for pair in self.cookies_raw().split(';') {
            if let Some((k, v)) = pair.split_once('=') {
                if k.trim() == name {
                    return v.trim().to_string();
                }
            }
        }
        String::new()
    }

    /// Decoded query parameters re-joined as `k=v&k=v`.
    pub fn args_concat(&self) -> String {
        form_urlencoded::parse(self.query.as_bytes())
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// A single decoded query parameter by name.
    pub fn arg(&self, name: &str) -> String {
        form_urlencoded::parse(self.query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default()
    }

    /// A single field of a URL-encoded request body.
    pub fn form_field(&self, name: &str) -> String {
        let body = match &self.body {
            Some(body) => body,
            None => return String::new(),
        };
        form_urlencoded::parse(body)
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default()
    }

    /// Single response header value, empty when absent or pre-phase-3.
    pub fn response_header(&self, name: &str) -> String {
        self.response_headers
            .as_ref()
            .and_then(|h| h.get(name))
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    /// All response headers as `name: value` lines.
    pub fn response_headers_concat(&self) -> String {
        let mut out = String::new();
        if let Some(headers) = &self.response_headers {
            for (name, value) in headers {
                out.push_str(name.as_str());
                out.push_str(": ");
                out.push_str(value.to_str().unwrap_or_default());
                out.push('\n');
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};

    fn ctx(uri: &str) -> RequestContext {
        RequestContext::new(
            &Method::GET,
            &uri.parse().unwrap(),
            HeaderMap::new(),
            "203.0.113.7".parse().unwrap(),
        )
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                k.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_uri_decomposition() {
        let ctx = ctx("/login?user=admin&redirect=%2Fhome");
        assert_eq!(ctx.path, "/login");
        assert_eq!(ctx.query, "user=admin&redirect=%2Fhome");
        assert_eq!(ctx.uri, "/login?user=admin&redirect=%2Fhome");
        assert_eq!(ctx.method, "GET");
    }

    #[test]
    fn test_args_decoding() {
        let ctx = ctx("/search?q=a%20b&lang=en");
        assert_eq!(ctx.args_concat(), "q=a b&lang=en");
        assert_eq!(ctx.arg("q"), "a b");
        assert_eq!(ctx.arg("lang"), "en");
        assert_eq!(ctx.arg("missing"), "");
    }

    #[test]
    fn test_cookie_parsing() {
        let mut ctx = ctx("/");
        ctx.headers = headers(&[("cookie", "session=abc123; theme=dark")]);
        assert_eq!(ctx.cookie("session"), "abc123");
        assert_eq!(ctx.cookie("theme"), "dark");
        assert_eq!(ctx.cookie("absent"), "");
    }

    #[test]
    fn test_form_field_requires_body() {
        let mut ctx = ctx("/submit");
        assert_eq!(ctx.form_field("user"), "");

        ctx.set_body(Bytes::from_static(b"user=alice&pass=s3cret"), false);
        assert_eq!(ctx.form_field("user"), "alice");
        assert_eq!(ctx.form_field("pass"), "s3cret");
    }

    #[test]
    fn test_headers_concat_shape() {
        let mut ctx = ctx("/");
        ctx.headers = headers(&[("x-a", "1"), ("x-b", "2")]);
        let concat = ctx.headers_concat();
        assert!(concat.contains("x-a: 1\n"));
        assert!(concat.contains("x-b: 2\n"));
    }

    #[test]
    fn test_client_ip_without_proxies() {
        let policy = ClientIpPolicy::new(&[]);
        let peer: SocketAddr = "198.51.100.4:40000".parse().unwrap();
        let hdrs = headers(&[("x-forwarded-for", "203.0.113.50")]);

        // No trusted proxies configured: headers are ignored.
        assert_eq!(policy.client_ip(peer, &hdrs), peer.ip());
    }

    #[test]
    fn test_client_ip_from_trusted_proxy() {
        let policy = ClientIpPolicy::new(&["10.0.0.0/8".to_string()]);
        let peer: SocketAddr = "10.1.2.3:40000".parse().unwrap();
        let hdrs = headers(&[("x-forwarded-for", "203.0.113.50, 10.9.9.9")]);

        // The rightmost non-proxy hop is the client.
        assert_eq!(
            policy.client_ip(peer, &hdrs),
            "203.0.113.50".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_client_ip_untrusted_peer_ignores_header() {
        let policy = ClientIpPolicy::new(&["10.0.0.0/8".to_string()]);
        let peer: SocketAddr = "198.51.100.4:40000".parse().unwrap();
        let hdrs = headers(&[("x-forwarded-for", "203.0.113.50")]);

        assert_eq!(policy.client_ip(peer, &hdrs), peer.ip());
    }

    #[test]
    fn test_response_side_empty_until_set() {
        let mut ctx = ctx("/");
        assert_eq!(ctx.response_header("content-type"), "");
        assert_eq!(ctx.response_body_text(), "");

        ctx.set_response(200, headers(&[("content-type", "text/html")]));
        ctx.set_response_body(Bytes::from_static(b"<html>"));
        assert_eq!(ctx.response_header("content-type"), "text/html");
        assert_eq!(ctx.response_body_text(), "<html>");
    }
}
