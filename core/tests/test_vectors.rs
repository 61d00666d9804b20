//! Verify status interpretation against `test-vectors/status.json`.
//!
//! Each case names a status code, an optional body, and the outcome expected
//! from `fetch` and from `delete`. Retries are disabled so each case is a
//! single exchange.

mod common;

use std::sync::Arc;

use common::{client, StubTransport};
use fhir_client::{ErrorKind, HttpResponse, OperationResult, RetryPolicy};

fn parse_kind(s: &str) -> Option<ErrorKind> {
    match s {
        "Ok" => None,
        "InvalidInput" => Some(ErrorKind::InvalidInput),
        "Unauthorized" => Some(ErrorKind::Unauthorized),
        "NotFound" => Some(ErrorKind::NotFound),
        "Conflict" => Some(ErrorKind::Conflict),
        "RateLimited" => Some(ErrorKind::RateLimited),
        "ServerError" => Some(ErrorKind::ServerError),
        "Unreachable" => Some(ErrorKind::Unreachable),
        "Cancelled" => Some(ErrorKind::Cancelled),
        "DecodeFailure" => Some(ErrorKind::DecodeFailure),
        other => panic!("unknown expected kind: {other}"),
    }
}

fn outcome_kind<T>(result: &OperationResult<T>) -> Option<ErrorKind> {
    result.as_ref().err().map(|e| e.kind())
}

fn response_for(case: &serde_json::Value) -> HttpResponse {
    let status = case["status"].as_u64().unwrap() as u16;
    let response = HttpResponse::new(status);
    if let Some(body) = case.get("body") {
        response.with_body(body.to_string())
    } else if let Some(text) = case["body_text"].as_str() {
        response.with_body(text)
    } else {
        response
    }
}

#[test]
fn status_test_vectors() {
    let raw = include_str!("../../test-vectors/status.json");
    let vectors: serde_json::Value = serde_json::from_str(raw).unwrap();

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();

        let transport = Arc::new(StubTransport::always(Ok(response_for(case))));
        let (c, _) = client(transport.clone(), RetryPolicy::none());
        let fetched = c.fetch("Patient", "123");
        assert_eq!(
            outcome_kind(&fetched),
            parse_kind(case["fetch"].as_str().unwrap()),
            "{name}: fetch"
        );

        let deleted = c.delete("Patient", "123");
        assert_eq!(
            outcome_kind(&deleted),
            parse_kind(case["delete"].as_str().unwrap()),
            "{name}: delete"
        );
        assert_eq!(transport.calls(), 2, "{name}: one exchange per operation");
    }
}

#[test]
fn every_mapped_status_has_a_vector() {
    let raw = include_str!("../../test-vectors/status.json");
    let vectors: serde_json::Value = serde_json::from_str(raw).unwrap();
    let statuses: Vec<u64> = vectors["cases"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["status"].as_u64().unwrap())
        .collect();
    for required in [200, 400, 401, 403, 404, 409, 412, 429, 500] {
        assert!(statuses.contains(&required), "missing vector for {required}");
    }
}
