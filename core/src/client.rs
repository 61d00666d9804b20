//! Resource client: typed CRUD and search over a `Transport`.
//!
//! # Design
//! `ResourceClient` holds only immutable configuration and shared, stateless
//! collaborators, so one instance can serve many threads at once. Each
//! operation is split into a `build_*` method that produces an `HttpRequest`
//! and a `parse_*` method that consumes an `HttpResponse`; both are pure and
//! tested without I/O. The executing methods (`fetch`, `create`, ...) glue
//! them together inside the retry loop.
//!
//! Retry eligibility is per operation: reads and deletes always, creates
//! only when the server can deduplicate them, updates never.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::AuthProvider;
use crate::cancel::CancellationToken;
use crate::config::ClientConfig;
use crate::error::{OperationError, OperationResult};
use crate::http::{HttpMethod, HttpRequest, HttpResponse, Transport};
use crate::resource::{validate_id, validate_resource_type, Resource, ResourceDocument, ResourceReference};
use crate::retry::{Sleeper, ThreadSleeper};
use crate::search::{parse_bundle, PageToken, SearchCursor, SearchQuery};
use crate::transport::UreqTransport;

pub const FHIR_JSON: &str = "application/fhir+json";

/// Per-call options: cancellation, deadline and create deduplication.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub cancel: Option<CancellationToken>,
    pub deadline: Option<Instant>,
    /// Sent as `Idempotency-Key`; makes `create` eligible for retry.
    pub idempotency_key: Option<String>,
    /// Sent as `If-None-Exist` (conditional create); also makes `create`
    /// eligible for retry.
    pub if_none_exist: Option<SearchQuery>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `budget` from now.
    pub fn with_timeout(self, budget: Duration) -> Self {
        self.with_deadline(Instant::now() + budget)
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Random v4 UUID key, generated once so every retry reuses it.
    pub fn with_generated_idempotency_key(self) -> Self {
        self.with_idempotency_key(Uuid::new_v4().to_string())
    }

    pub fn with_if_none_exist(mut self, query: SearchQuery) -> Self {
        self.if_none_exist = Some(query);
        self
    }

    /// The key actually sent; an empty one is dropped.
    fn sent_idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref().filter(|k| !k.is_empty())
    }

    /// The condition actually sent; an empty query is dropped.
    fn sent_if_none_exist(&self) -> Option<&SearchQuery> {
        self.if_none_exist.as_ref().filter(|q| !q.is_empty())
    }

    /// Whether a create carrying these options can be deduplicated by the
    /// server, and so retried.
    fn deduplicates_create(&self) -> bool {
        self.sent_idempotency_key().is_some() || self.sent_if_none_exist().is_some()
    }
}

/// Which operation an attempt belongs to; used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Fetch,
    Create,
    Update,
    Delete,
    Search,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Operation::Fetch => "fetch",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Search => "search",
        }
    }
}

/// Thread-safe client for one FHIR server.
#[derive(Clone)]
pub struct ResourceClient<T = UreqTransport> {
    config: ClientConfig,
    transport: T,
    auth: Option<Arc<dyn AuthProvider>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<T> fmt::Debug for ResourceClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceClient")
            .field("config", &self.config)
            .field("auth", &self.auth.is_some())
            .finish_non_exhaustive()
    }
}

impl ResourceClient<UreqTransport> {
    /// Client over the production HTTP transport.
    pub fn connect(config: ClientConfig) -> Self {
        let transport = UreqTransport::from_config(&config);
        Self::new(config, transport)
    }
}

impl<T: Transport> ResourceClient<T> {
    pub fn new(config: ClientConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            auth: None,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_auth(mut self, provider: impl AuthProvider + 'static) -> Self {
        self.auth = Some(Arc::new(provider));
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub fn fetch(&self, resource_type: &str, id: &str) -> OperationResult<ResourceDocument> {
        self.fetch_with(resource_type, id, &RequestOptions::default())
    }

    pub fn fetch_with(
        &self,
        resource_type: &str,
        id: &str,
        options: &RequestOptions,
    ) -> OperationResult<ResourceDocument> {
        let request = self.build_fetch(resource_type, id)?;
        self.execute(Operation::Fetch, &request, true, options, |response| {
            self.parse_fetch(resource_type, response)
        })
    }

    /// Read one historical version (`vread`).
    pub fn fetch_version(
        &self,
        resource_type: &str,
        id: &str,
        version_id: &str,
    ) -> OperationResult<ResourceDocument> {
        self.fetch_version_with(resource_type, id, version_id, &RequestOptions::default())
    }

    pub fn fetch_version_with(
        &self,
        resource_type: &str,
        id: &str,
        version_id: &str,
        options: &RequestOptions,
    ) -> OperationResult<ResourceDocument> {
        let request = self.build_fetch_version(resource_type, id, version_id)?;
        self.execute(Operation::Fetch, &request, true, options, |response| {
            self.parse_fetch(resource_type, response)
        })
    }

    pub fn fetch_as<R: Resource>(&self, id: &str) -> OperationResult<R> {
        self.fetch(R::RESOURCE_TYPE, id)?.to_typed()
    }

    pub fn create(
        &self,
        resource_type: &str,
        document: &ResourceDocument,
    ) -> OperationResult<ResourceDocument> {
        self.create_with(resource_type, document, &RequestOptions::default())
    }

    pub fn create_with(
        &self,
        resource_type: &str,
        document: &ResourceDocument,
        options: &RequestOptions,
    ) -> OperationResult<ResourceDocument> {
        let request = self.build_create(resource_type, document, options)?;
        let retry_safe = options.deduplicates_create();
        self.execute(Operation::Create, &request, retry_safe, options, |response| {
            self.parse_create(resource_type, document, response)
        })
    }

    pub fn create_as<R: Resource>(&self, resource: &R) -> OperationResult<R> {
        let document = ResourceDocument::from_typed(resource)?;
        self.create(R::RESOURCE_TYPE, &document)?.to_typed()
    }

    /// Replace the document stored at `resource_type/id`. Never retried:
    /// on `Conflict` the caller re-fetches and resubmits.
    pub fn update(
        &self,
        resource_type: &str,
        id: &str,
        document: &ResourceDocument,
    ) -> OperationResult<ResourceDocument> {
        self.update_with(resource_type, id, document, &RequestOptions::default())
    }

    pub fn update_with(
        &self,
        resource_type: &str,
        id: &str,
        document: &ResourceDocument,
        options: &RequestOptions,
    ) -> OperationResult<ResourceDocument> {
        let request = self.build_update(resource_type, id, document)?;
        self.execute(Operation::Update, &request, false, options, |response| {
            self.parse_update(resource_type, id, document, response)
        })
    }

    /// Delete `resource_type/id`. Deleting an absent resource succeeds.
    pub fn delete(&self, resource_type: &str, id: &str) -> OperationResult<()> {
        self.delete_with(resource_type, id, &RequestOptions::default())
    }

    pub fn delete_with(
        &self,
        resource_type: &str,
        id: &str,
        options: &RequestOptions,
    ) -> OperationResult<()> {
        let request = self.build_delete(resource_type, id)?;
        self.execute(Operation::Delete, &request, true, options, |response| {
            self.parse_delete(response)
        })
    }

    /// Run a search, or continue one when `page` is a token from a previous
    /// result (the query is then ignored).
    pub fn search(
        &self,
        resource_type: &str,
        query: &SearchQuery,
        page: Option<&PageToken>,
    ) -> OperationResult<SearchCursor> {
        self.search_with(resource_type, query, page, &RequestOptions::default())
    }

    pub fn search_with(
        &self,
        resource_type: &str,
        query: &SearchQuery,
        page: Option<&PageToken>,
        options: &RequestOptions,
    ) -> OperationResult<SearchCursor> {
        let request = self.build_search(resource_type, query, page)?;
        self.execute(Operation::Search, &request, true, options, |response| {
            self.parse_search(response)
        })
    }

    // -----------------------------------------------------------------------
    // Request builders
    // -----------------------------------------------------------------------

    pub fn build_fetch(&self, resource_type: &str, id: &str) -> OperationResult<HttpRequest> {
        let reference = ResourceReference::new(resource_type, id)?;
        Ok(self.request(HttpMethod::Get, reference.path()))
    }

    pub fn build_fetch_version(
        &self,
        resource_type: &str,
        id: &str,
        version_id: &str,
    ) -> OperationResult<HttpRequest> {
        let reference = ResourceReference::new(resource_type, id)?;
        validate_id(version_id)?;
        Ok(self.request(
            HttpMethod::Get,
            format!("{}/_history/{version_id}", reference.path()),
        ))
    }

    pub fn build_create(
        &self,
        resource_type: &str,
        document: &ResourceDocument,
        options: &RequestOptions,
    ) -> OperationResult<HttpRequest> {
        validate_resource_type(resource_type)?;
        check_document_type(resource_type, document)?;
        let mut request = self.write_request(HttpMethod::Post, resource_type.to_string(), document)?;
        if let Some(key) = options.sent_idempotency_key() {
            request.headers.push(("idempotency-key".to_string(), key.to_string()));
        }
        if let Some(query) = options.sent_if_none_exist() {
            request.headers.push(("if-none-exist".to_string(), query.to_query_string()));
        }
        Ok(request)
    }

    /// The body always carries `id`; a differing id in the document is
    /// rejected. A `meta.versionId` becomes a weak `If-Match` precondition.
    pub fn build_update(
        &self,
        resource_type: &str,
        id: &str,
        document: &ResourceDocument,
    ) -> OperationResult<HttpRequest> {
        let reference = ResourceReference::new(resource_type, id)?;
        check_document_type(resource_type, document)?;
        let document = match document.id() {
            Some(existing) if existing != id => {
                return Err(OperationError::invalid_input(format!(
                    "document id {existing:?} does not match {reference}"
                )))
            }
            Some(_) => document.clone(),
            None => document.with_id(id),
        };
        let mut request = self.write_request(HttpMethod::Put, reference.path(), &document)?;
        if let Some(version) = document.version_id() {
            request.headers.push(("if-match".to_string(), format!("W/\"{version}\"")));
        }
        Ok(request)
    }

    pub fn build_delete(&self, resource_type: &str, id: &str) -> OperationResult<HttpRequest> {
        let reference = ResourceReference::new(resource_type, id)?;
        Ok(self.request(HttpMethod::Delete, reference.path()))
    }

    pub fn build_search(
        &self,
        resource_type: &str,
        query: &SearchQuery,
        page: Option<&PageToken>,
    ) -> OperationResult<HttpRequest> {
        validate_resource_type(resource_type)?;
        let path = match page {
            Some(token) => token.as_path().to_string(),
            None if query.is_empty() => resource_type.to_string(),
            None => format!("{resource_type}?{}", query.to_query_string()),
        };
        Ok(self.request(HttpMethod::Get, path))
    }

    fn request(&self, method: HttpMethod, path: String) -> HttpRequest {
        let mut request = HttpRequest::new(method, path);
        request.headers.extend(self.config.default_headers().iter().cloned());
        request.headers.push(("accept".to_string(), FHIR_JSON.to_string()));
        request
    }

    fn write_request(
        &self,
        method: HttpMethod,
        path: String,
        document: &ResourceDocument,
    ) -> OperationResult<HttpRequest> {
        let mut request = self.request(method, path);
        request.headers.push(("content-type".to_string(), FHIR_JSON.to_string()));
        request.headers.push(("prefer".to_string(), "return=representation".to_string()));
        request.body = Some(document.to_bytes()?);
        Ok(request)
    }

    // -----------------------------------------------------------------------
    // Response parsers
    // -----------------------------------------------------------------------

    pub fn parse_fetch(
        &self,
        resource_type: &str,
        response: HttpResponse,
    ) -> OperationResult<ResourceDocument> {
        check_status(&response)?;
        decode_document(resource_type, &response.body)
    }

    /// 201 and 200 (a conditional create that matched) both succeed. An
    /// empty body is answered from the submitted document and `Location`.
    pub fn parse_create(
        &self,
        resource_type: &str,
        submitted: &ResourceDocument,
        response: HttpResponse,
    ) -> OperationResult<ResourceDocument> {
        check_status(&response)?;
        if !body_is_empty(&response) {
            return decode_document(resource_type, &response.body);
        }
        let location = response
            .header("location")
            .or_else(|| response.header("content-location"))
            .ok_or_else(|| OperationError::decode("create returned neither a body nor a Location"))?;
        let (id, version) = parse_location(location, resource_type)
            .ok_or_else(|| OperationError::decode(format!("unrecognised Location {location:?}")))?;
        let document = submitted.with_id(&id);
        Ok(match version {
            Some(version) => document.with_version_id(&version),
            None => document,
        })
    }

    /// 200 and 201 are treated alike: some servers create on update.
    pub fn parse_update(
        &self,
        resource_type: &str,
        id: &str,
        submitted: &ResourceDocument,
        response: HttpResponse,
    ) -> OperationResult<ResourceDocument> {
        check_status(&response)?;
        if !body_is_empty(&response) {
            return decode_document(resource_type, &response.body);
        }
        let document = submitted.with_id(id);
        let version = response
            .header("etag")
            .and_then(parse_etag)
            .or_else(|| {
                response
                    .header("location")
                    .and_then(|l| parse_location(l, resource_type))
                    .and_then(|(_, v)| v)
            });
        Ok(match version {
            Some(version) => document.with_version_id(&version),
            None => document,
        })
    }

    /// 200, 202 and 204 succeed; so do 404 and 410, since the resource is
    /// gone either way.
    pub fn parse_delete(&self, response: HttpResponse) -> OperationResult<()> {
        if response.is_success() || matches!(response.status, 404 | 410) {
            return Ok(());
        }
        Err(OperationError::from_response(&response))
    }

    pub fn parse_search(&self, response: HttpResponse) -> OperationResult<SearchCursor> {
        check_status(&response)?;
        parse_bundle(&response.body, self.config.base_url())
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    fn execute<R>(
        &self,
        operation: Operation,
        request: &HttpRequest,
        retry_safe: bool,
        options: &RequestOptions,
        parse: impl Fn(HttpResponse) -> OperationResult<R>,
    ) -> OperationResult<R> {
        let span = tracing::debug_span!(
            "fhir_request",
            operation = operation.as_str(),
            method = %request.method,
            path = %request.path,
        );
        let _enter = span.enter();

        let policy = self.config.retry();
        let max_attempts = if retry_safe { policy.max_attempts.max(1) } else { 1 };
        let cancel = options.cancel.clone().unwrap_or_default();

        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                debug!(attempt, "cancelled before attempt");
                return Err(OperationError::Cancelled);
            }
            let timeout = match remaining(options.deadline) {
                Some(left) if left.is_zero() => {
                    debug!(attempt, "deadline passed before attempt");
                    return Err(OperationError::Cancelled);
                }
                Some(left) => left.min(self.config.timeout()),
                None => self.config.timeout(),
            };

            let error = match self.attempt(request, timeout).and_then(&parse) {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !retry_safe || !error.is_retryable() || attempt >= max_attempts {
                debug!(attempt, %error, "giving up");
                return Err(error);
            }

            let delay = match error {
                OperationError::RateLimited { retry_after } => {
                    match policy.rate_limit_delay(attempt, retry_after) {
                        Some(delay) => delay,
                        None => {
                            debug!(?retry_after, "server asked to wait longer than max_retry_after");
                            return Err(error);
                        }
                    }
                }
                _ => policy.delay(attempt),
            };
            if let Some(left) = remaining(options.deadline) {
                if delay >= left {
                    debug!(attempt, ?delay, "backoff would pass the deadline");
                    return Err(OperationError::Cancelled);
                }
            }

            warn!(attempt, max_attempts, ?delay, %error, "retrying");
            if self.sleeper.sleep(delay, &cancel) {
                debug!(attempt, "cancelled during backoff");
                return Err(OperationError::Cancelled);
            }
            attempt += 1;
        }
    }

    /// One decorated send. Auth failures never reach the network.
    fn attempt(&self, request: &HttpRequest, timeout: Duration) -> OperationResult<HttpResponse> {
        let decorated;
        let request = match &self.auth {
            Some(auth) => {
                let mut copy = request.clone();
                auth.decorate(&mut copy.headers)
                    .map_err(|e| OperationError::Unauthorized {
                        status: None,
                        details: e.to_string(),
                    })?;
                decorated = copy;
                &decorated
            }
            None => request,
        };
        let response = self.transport.send(request, timeout)?;
        debug!(status = response.status, "response received");
        Ok(response)
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

/// Map non-2xx status codes to the appropriate `OperationError` variant.
fn check_status(response: &HttpResponse) -> OperationResult<()> {
    if response.is_success() {
        Ok(())
    } else {
        Err(OperationError::from_response(response))
    }
}

fn check_document_type(resource_type: &str, document: &ResourceDocument) -> OperationResult<()> {
    if document.resource_type() == resource_type {
        Ok(())
    } else {
        Err(OperationError::invalid_input(format!(
            "document resourceType {:?} does not match {resource_type:?}",
            document.resource_type()
        )))
    }
}

fn body_is_empty(response: &HttpResponse) -> bool {
    response.body.iter().all(u8::is_ascii_whitespace)
}

fn decode_document(resource_type: &str, body: &[u8]) -> OperationResult<ResourceDocument> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(OperationError::decode("empty response body"));
    }
    let document = ResourceDocument::from_slice(body)?;
    if document.resource_type() != resource_type {
        return Err(OperationError::decode(format!(
            "expected {resource_type}, got {}",
            document.resource_type()
        )));
    }
    Ok(document)
}

/// Extract `(id, versionId)` from a `Location` such as
/// `http://host/fhir/Patient/abc/_history/2`.
fn parse_location(location: &str, resource_type: &str) -> Option<(String, Option<String>)> {
    let path = location.split(['?', '#']).next()?;
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let pos = segments.iter().rposition(|s| *s == resource_type)?;
    let id = segments.get(pos + 1)?;
    validate_id(id).ok()?;
    let version = match (segments.get(pos + 2), segments.get(pos + 3)) {
        (Some(&"_history"), Some(v)) => Some(v.to_string()),
        _ => None,
    };
    Some((id.to_string(), version))
}

/// `W/"3"` or `"3"` → `3`.
fn parse_etag(etag: &str) -> Option<String> {
    let value = etag.trim().trim_start_matches("W/").trim_matches('"');
    (!value.is_empty()).then(|| value.to_string())
}
