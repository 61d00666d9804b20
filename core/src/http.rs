//! HTTP transport types and the `Transport` seam.
//!
//! # Design
//! Requests and responses are plain data. The resource client builds an
//! `HttpRequest` with a path relative to the server base URL, hands it to a
//! `Transport`, and interprets the returned `HttpResponse`. The transport
//! never retries and never interprets status codes; retry policy and error
//! mapping live in the client.
//!
//! Bodies are raw bytes. The declared content type travels in `headers`.

use std::fmt;
use std::time::Duration;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTTP request described as plain data.
///
/// `path` is relative to the server base URL and already percent-encoded,
/// e.g. `Patient/123` or `Patient?family=Smith`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Case-insensitive header lookup returning the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// An HTTP response described as plain data: the literal status, headers and
/// body the transport received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup returning the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as text, lossily decoded. Used for error details only.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// The request never produced a usable response: connection refused, DNS
/// failure, timeout, TLS handshake failure and the like all land here.
///
/// `oversized_body` marks a response that arrived but whose body exceeded
/// the transport's read limit; the network worked, so it is not retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport failure: {reason}")]
pub struct TransportFailure {
    pub reason: String,
    pub oversized_body: bool,
}

impl TransportFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            oversized_body: false,
        }
    }

    pub fn oversized(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            oversized_body: true,
        }
    }
}

/// Issues one HTTP request and returns whatever came back.
///
/// Implementations must enforce `timeout` for the whole call, must not retry,
/// and must report every status code as data rather than as a failure.
/// They are shared across threads, so any pooling is internal.
pub trait Transport: Send + Sync {
    fn send(&self, request: &HttpRequest, timeout: Duration) -> Result<HttpResponse, TransportFailure>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, request: &HttpRequest, timeout: Duration) -> Result<HttpResponse, TransportFailure> {
        (**self).send(request, timeout)
    }
}

impl<T: Transport + ?Sized> Transport for &T {
    fn send(&self, request: &HttpRequest, timeout: Duration) -> Result<HttpResponse, TransportFailure> {
        (**self).send(request, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let response = HttpResponse::new(200).with_header("Retry-After", "3");
        assert_eq!(response.header("retry-after"), Some("3"));
        assert_eq!(response.header("RETRY-AFTER"), Some("3"));
        assert_eq!(response.header("location"), None);
    }

    #[test]
    fn success_range_is_2xx() {
        assert!(HttpResponse::new(200).is_success());
        assert!(HttpResponse::new(204).is_success());
        assert!(!HttpResponse::new(301).is_success());
        assert!(!HttpResponse::new(404).is_success());
    }

    #[test]
    fn method_names_are_uppercase() {
        assert_eq!(HttpMethod::Delete.to_string(), "DELETE");
        assert_eq!(HttpMethod::Post.as_str(), "POST");
    }
}
