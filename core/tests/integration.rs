//! Full resource lifecycle against the live mock server.
//!
//! # Design
//! Starts the mock server on a random port, then exercises every client
//! operation over real HTTP through `UreqTransport`. Validates that request
//! building, status mapping and bundle paging work end to end.

use std::net::SocketAddr;
use std::sync::Arc;

use fhir_client::{
    ClientConfig, ErrorKind, Gender, HumanName, Patient, RecordingSleeper, RequestOptions, ResourceClient,
    ResourceDocument, RetryPolicy, SearchQuery, UreqTransport,
};
use serde_json::json;

fn start_server() -> SocketAddr {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_fhir_server::run(listener).await
        })
        .unwrap();
    });

    addr
}

fn client_for(addr: SocketAddr) -> ResourceClient {
    let config = ClientConfig::new(&format!("http://{addr}"))
        .unwrap()
        .with_retry(RetryPolicy::none());
    ResourceClient::connect(config)
}

fn patient() -> ResourceDocument {
    ResourceDocument::from_value(json!({
        "resourceType": "Patient",
        "name": [{"family": "Chalmers", "given": ["Peter", "James"]}],
        "gender": "male",
        "birthDate": "1990-01-01"
    }))
    .unwrap()
}

#[test]
fn crud_lifecycle() {
    let client = client_for(start_server());

    // Step 1: create.
    let submitted = patient();
    let created = client.create("Patient", &submitted).unwrap();
    let id = created.id().unwrap().to_string();
    assert!(created.contains_fields_of(&submitted));
    assert_eq!(created.version_id(), Some("1"));
    assert!(created.last_updated().is_some());

    // Step 2: fetch returns the caller's fields.
    let fetched = client.fetch("Patient", &id).unwrap();
    assert!(fetched.contains_fields_of(&submitted));
    assert_eq!(fetched, created);

    // Step 3: update from the fetched version.
    let changed = fetched.with_field("gender", "other");
    let updated = client.update("Patient", &id, &changed).unwrap();
    assert_eq!(updated.get("gender"), Some(&json!("other")));
    assert_eq!(updated.version_id(), Some("2"));

    // Step 4: resubmitting the stale version is a conflict.
    let err = client.update("Patient", &id, &changed).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // Step 5: the first version is still readable.
    let first = client.fetch_version("Patient", &id, "1").unwrap();
    assert_eq!(first.get("gender"), Some(&json!("male")));

    // Step 6: delete twice; both succeed.
    client.delete("Patient", &id).unwrap();
    client.delete("Patient", &id).unwrap();

    // Step 7: fetch after delete.
    let err = client.fetch("Patient", &id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn typed_round_trip() {
    let client = client_for(start_server());

    let patient = Patient {
        name: vec![HumanName {
            family: Some("Nakamura".to_string()),
            given: vec!["Aiko".to_string()],
            ..HumanName::default()
        }],
        gender: Some(Gender::Female),
        birth_date: Some("1985-07-14".to_string()),
        ..Patient::new()
    };
    let created = client.create_as(&patient).unwrap();
    let id = created.id.clone().unwrap();

    let fetched: Patient = client.fetch_as(&id).unwrap();
    assert_eq!(fetched.name, patient.name);
    assert_eq!(fetched.gender, Some(Gender::Female));
    assert!(fetched.extra.contains_key("meta"));
}

#[test]
fn search_follows_pages_to_the_end() {
    let client = client_for(start_server());
    for n in 0..5 {
        let doc = patient().with_field("gender", if n % 2 == 0 { "female" } else { "male" });
        client.create("Patient", &doc).unwrap();
    }

    let query = SearchQuery::new().param("gender", "female").count(2);
    let first = client.search("Patient", &query, None).unwrap();
    assert_eq!(first.total, Some(3));
    assert_eq!(first.resources.len(), 2);
    assert!(first.has_more());

    let second = client.search("Patient", &query, first.next_page()).unwrap();
    assert_eq!(second.resources.len(), 1);
    assert!(!second.has_more());

    let mut ids: Vec<String> = first
        .resources
        .iter()
        .chain(&second.resources)
        .map(|r| r.id().unwrap().to_string())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert!(first
        .resources
        .iter()
        .chain(&second.resources)
        .all(|r| r.get("gender") == Some(&json!("female"))));
}

#[test]
fn idempotent_create_is_deduplicated_by_the_server() {
    let client = client_for(start_server());
    let options = RequestOptions::new().with_idempotency_key("intake-form-77");

    let first = client.create_with("Patient", &patient(), &options).unwrap();
    let second = client.create_with("Patient", &patient(), &options).unwrap();

    assert_eq!(first.id(), second.id());
}

#[test]
fn server_errors_carry_outcome_details() {
    let client = client_for(start_server());

    let query = SearchQuery::new().param("_count", "lots");
    let err = client.search("Patient", &query, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(err.to_string().contains("_count must be a number"));

    let err = client.fetch("Patient", "does-not-exist").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("Patient/does-not-exist"));
}

#[test]
fn oversized_response_is_a_decode_failure_and_not_retried() {
    let addr = start_server();
    let created = client_for(addr).create("Patient", &patient()).unwrap();
    let id = created.id().unwrap();

    let base_url = format!("http://{addr}");
    let config = ClientConfig::new(&base_url).unwrap();
    let transport = UreqTransport::new(&base_url).with_body_limit(64);
    let sleeper = Arc::new(RecordingSleeper::new());
    let client = ResourceClient::new(config, transport).with_sleeper(sleeper.clone());

    let err = client.fetch("Patient", id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DecodeFailure);
    assert!(sleeper.delays().is_empty());
}

#[test]
fn unreachable_server_maps_to_unreachable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(addr);
    let err = client.fetch("Patient", "1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unreachable);
}
