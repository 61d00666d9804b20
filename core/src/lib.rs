//! Typed, retrying client for FHIR-style RESTful healthcare servers.
//!
//! # Overview
//! `ResourceClient` exposes `fetch`, `create`, `update`, `delete` and
//! `search` for any resource type, exchanging `ResourceDocument`s as JSON.
//! Every outcome is an `OperationResult`: transport and protocol failures are
//! mapped onto a fixed `ErrorKind` taxonomy, and transient failures are
//! retried with capped, jittered exponential backoff where that is safe.
//!
//! # Design
//! - The client holds only immutable configuration; it is `Send + Sync` and
//!   meant to be shared across threads.
//! - Each operation is split into `build_*` (request) and `parse_*`
//!   (response) so the I/O boundary is explicit and testable.
//! - The network sits behind the `Transport` trait. `UreqTransport` is the
//!   blocking production adapter; tests plug in stubs.
//! - Credentials are attached per attempt by an `AuthProvider`.

pub mod auth;
pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod resource;
pub mod retry;
pub mod search;
pub mod transport;
pub mod types;

pub use auth::{AuthError, AuthProvider, BearerToken};
pub use cancel::CancellationToken;
pub use client::{RequestOptions, ResourceClient};
pub use config::{ClientConfig, ConfigError};
pub use error::{ErrorKind, OperationError, OperationResult};
pub use http::{HttpMethod, HttpRequest, HttpResponse, Transport, TransportFailure};
pub use resource::{Resource, ResourceDocument, ResourceReference};
pub use retry::{RecordingSleeper, RetryPolicy, Sleeper, ThreadSleeper};
pub use search::{PageToken, SearchCursor, SearchQuery};
pub use transport::UreqTransport;
pub use types::{Gender, HumanName, Patient};
