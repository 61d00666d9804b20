//! Blocking transport adapter backed by `ureq`.
//!
//! # Design
//! One `ureq::Agent` is created per adapter and reused for every call, so
//! connections are pooled inside the agent and sized independently of how
//! many threads share the client. Status-as-error is disabled: 4xx/5xx come
//! back as `HttpResponse` data and only failures to obtain a response at all
//! become `TransportFailure`. Bodies are read up to `body_limit`; a larger
//! body is reported as an oversized-body failure rather than a network one.

use std::time::Duration;

use ureq::{Agent, RequestBuilder};

use crate::config::ClientConfig;
use crate::http::{HttpMethod, HttpRequest, HttpResponse, Transport, TransportFailure};

/// Largest response body read by default: 64 MiB.
pub const DEFAULT_BODY_LIMIT: u64 = 64 * 1024 * 1024;

/// Production transport resolving relative paths against a base URL.
#[derive(Debug, Clone)]
pub struct UreqTransport {
    base_url: String,
    agent: Agent,
    body_limit: u64,
}

impl UreqTransport {
    pub fn new(base_url: &str) -> Self {
        let agent = Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .new_agent();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    /// Cap on response body size, in bytes.
    pub fn with_body_limit(mut self, limit: u64) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.base_url())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Join a relative path onto the base URL. Paths that start with `?`
    /// address the base itself (some servers page searches that way).
    pub fn url_for(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.starts_with('?') || path.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}

fn prepare<B>(
    mut builder: RequestBuilder<B>,
    request: &HttpRequest,
    timeout: Duration,
) -> RequestBuilder<B> {
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.config().timeout_global(Some(timeout)).build()
}

impl Transport for UreqTransport {
    fn send(&self, request: &HttpRequest, timeout: Duration) -> Result<HttpResponse, TransportFailure> {
        let url = self.url_for(&request.path);
        tracing::trace!(method = %request.method, %url, "sending request");

        let result = match (request.method, request.body.as_deref()) {
            (HttpMethod::Get, _) => prepare(self.agent.get(&url), request, timeout).call(),
            (HttpMethod::Delete, _) => prepare(self.agent.delete(&url), request, timeout).call(),
            (HttpMethod::Post, Some(body)) => prepare(self.agent.post(&url), request, timeout).send(body),
            (HttpMethod::Post, None) => prepare(self.agent.post(&url), request, timeout).send_empty(),
            (HttpMethod::Put, Some(body)) => prepare(self.agent.put(&url), request, timeout).send(body),
            (HttpMethod::Put, None) => prepare(self.agent.put(&url), request, timeout).send_empty(),
        };

        let mut response = result
            .map_err(|e| TransportFailure::new(format!("{} {url}: {e}", request.method)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
                (name.as_str().to_string(), value)
            })
            .collect();
        let body = response
            .body_mut()
            .with_config()
            .limit(self.body_limit)
            .read_to_vec()
            .map_err(|e| match e {
                ureq::Error::BodyExceedsLimit(limit) => {
                    TransportFailure::oversized(format!("response body from {url} exceeds {limit} bytes"))
                }
                e => TransportFailure::new(format!("reading body from {url}: {e}")),
            })?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
