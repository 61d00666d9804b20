//! Error taxonomy for resource operations.
//!
//! # Design
//! Every operation returns `OperationResult<T>`; nothing the server or the
//! network does escapes as a panic. `OperationError` carries context for
//! humans (status, details) while `ErrorKind` is the fieldless mirror used
//! for matching and for the retry decision.
//!
//! Status interpretation is uniform across operations. The only per-operation
//! exception (DELETE treats 404 as success) is applied by the client before
//! it reaches `from_response`.

use std::fmt;
use std::time::Duration;

use serde_json::Value;

use crate::http::{HttpResponse, TransportFailure};

pub type OperationResult<T> = Result<T, OperationError>;

/// Longest error detail kept from a non-FHIR response body.
const MAX_DETAIL_LEN: usize = 512;

/// The kinds of failure a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    Unauthorized,
    NotFound,
    Conflict,
    RateLimited,
    ServerError,
    Unreachable,
    Cancelled,
    DecodeFailure,
}

impl ErrorKind {
    /// Transient kinds that an idempotent operation may repeat.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::ServerError | ErrorKind::Unreachable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::ServerError => "ServerError",
            ErrorKind::Unreachable => "Unreachable",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::DecodeFailure => "DecodeFailure",
        };
        f.write_str(name)
    }
}

/// Errors returned by `ResourceClient` operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// Rejected locally before sending, or the server answered 400/422.
    /// `status` is `None` for local validation failures.
    #[error("invalid input: {details}")]
    InvalidInput { status: Option<u16>, details: String },

    /// 401/403, or the auth provider refused to decorate the request.
    #[error("unauthorized: {details}")]
    Unauthorized { status: Option<u16>, details: String },

    #[error("not found: {details}")]
    NotFound { status: u16, details: String },

    /// 409/412. The caller must re-read and resubmit.
    #[error("conflict (HTTP {status}): {details}")]
    Conflict { status: u16, details: String },

    #[error("rate limited{}", retry_after_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error (HTTP {status}): {details}")]
    ServerError { status: u16, details: String },

    #[error("server unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("operation cancelled")]
    Cancelled,

    /// The response could not be decoded as the expected document.
    #[error("failed to decode response: {reason}")]
    DecodeFailure { reason: String },
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

impl OperationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OperationError::InvalidInput { .. } => ErrorKind::InvalidInput,
            OperationError::Unauthorized { .. } => ErrorKind::Unauthorized,
            OperationError::NotFound { .. } => ErrorKind::NotFound,
            OperationError::Conflict { .. } => ErrorKind::Conflict,
            OperationError::RateLimited { .. } => ErrorKind::RateLimited,
            OperationError::ServerError { .. } => ErrorKind::ServerError,
            OperationError::Unreachable { .. } => ErrorKind::Unreachable,
            OperationError::Cancelled => ErrorKind::Cancelled,
            OperationError::DecodeFailure { .. } => ErrorKind::DecodeFailure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn invalid_input(details: impl Into<String>) -> Self {
        OperationError::InvalidInput {
            status: None,
            details: details.into(),
        }
    }

    pub fn decode(reason: impl fmt::Display) -> Self {
        OperationError::DecodeFailure {
            reason: reason.to_string(),
        }
    }

    /// Map a non-2xx response onto the taxonomy.
    pub fn from_response(response: &HttpResponse) -> Self {
        let status = response.status;
        match status {
            400 | 422 => OperationError::InvalidInput {
                status: Some(status),
                details: error_details(response),
            },
            401 | 403 => OperationError::Unauthorized {
                status: Some(status),
                details: error_details(response),
            },
            404 | 410 => OperationError::NotFound {
                status,
                details: error_details(response),
            },
            409 | 412 => OperationError::Conflict {
                status,
                details: error_details(response),
            },
            429 => OperationError::RateLimited {
                retry_after: response.header("retry-after").and_then(parse_retry_after),
            },
            400..=499 => OperationError::InvalidInput {
                status: Some(status),
                details: error_details(response),
            },
            500..=599 => OperationError::ServerError {
                status,
                details: error_details(response),
            },
            _ => OperationError::DecodeFailure {
                reason: format!("unexpected HTTP status {status}"),
            },
        }
    }
}

impl From<TransportFailure> for OperationError {
    fn from(failure: TransportFailure) -> Self {
        if failure.oversized_body {
            OperationError::DecodeFailure {
                reason: failure.reason,
            }
        } else {
            OperationError::Unreachable {
                reason: failure.reason,
            }
        }
    }
}

/// `Retry-After` in its delta-seconds form. HTTP-dates are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Pull a readable message out of an error response.
///
/// FHIR servers answer errors with an `OperationOutcome`; its issue
/// diagnostics are joined. Anything else falls back to the raw body.
fn error_details(response: &HttpResponse) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(&response.body) {
        if let Some(message) = outcome_message(&value) {
            return message;
        }
    }
    let text = response.body_text();
    let text = text.trim();
    if text.is_empty() {
        return format!("HTTP {}", response.status);
    }
    if text.len() > MAX_DETAIL_LEN {
        let mut end = MAX_DETAIL_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        return format!("{}...", &text[..end]);
    }
    text.to_string()
}

fn outcome_message(value: &Value) -> Option<String> {
    if value.get("resourceType")?.as_str()? != "OperationOutcome" {
        return None;
    }
    let messages: Vec<&str> = value
        .get("issue")?
        .as_array()?
        .iter()
        .filter_map(|issue| {
            issue
                .get("diagnostics")
                .and_then(Value::as_str)
                .or_else(|| issue.pointer("/details/text").and_then(Value::as_str))
        })
        .collect();
    if messages.is_empty() {
        None
    } else {
        Some(messages.join("; "))
    }
}
