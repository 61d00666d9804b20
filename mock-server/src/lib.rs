//! In-memory FHIR-style REST server for exercising the client end to end.
//!
//! Supports read, vread, create (with `Idempotency-Key` and `If-None-Exist`
//! deduplication), version-aware update (`If-Match`), delete, and paged
//! search with `_count`/`_offset` and exact-match filters on top-level
//! string fields. Nothing is persisted.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use url::form_urlencoded;
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: usize = 10;

/// Every stored version of one resource, oldest first.
#[derive(Debug, Default)]
struct History {
    versions: Vec<Value>,
    deleted: bool,
}

impl History {
    fn current(&self) -> Option<&Value> {
        if self.deleted {
            None
        } else {
            self.versions.last()
        }
    }

    fn next_version(&self) -> usize {
        self.versions.len() + 1
    }
}

#[derive(Debug, Default)]
pub struct Store {
    resources: BTreeMap<(String, String), History>,
    idempotency: HashMap<String, (String, String)>,
}

pub type Db = Arc<RwLock<Store>>;

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(Store::default()));
    Router::new()
        .route("/{resource_type}", get(search).post(create))
        .route(
            "/{resource_type}/{id}",
            get(read).put(update).delete(delete),
        )
        .route("/{resource_type}/{id}/_history/{version}", get(vread))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

fn outcome(status: StatusCode, code: &str, diagnostics: impl Into<String>) -> Response {
    let body = json!({
        "resourceType": "OperationOutcome",
        "issue": [{"severity": "error", "code": code, "diagnostics": diagnostics.into()}]
    });
    (status, Json(body)).into_response()
}

fn not_found(resource_type: &str, id: &str) -> Response {
    outcome(
        StatusCode::NOT_FOUND,
        "not-found",
        format!("{resource_type}/{id} is not known"),
    )
}

fn stamp(mut resource: Value, id: &str, version: usize) -> Value {
    resource["id"] = json!(id);
    resource["meta"] = json!({
        "versionId": version.to_string(),
        "lastUpdated": chrono::Utc::now().to_rfc3339(),
    });
    resource
}

fn stored_response(status: StatusCode, resource_type: &str, resource: &Value) -> Response {
    let id = resource["id"].as_str().unwrap_or_default();
    let version = resource["meta"]["versionId"].as_str().unwrap_or_default();
    (
        status,
        [
            (header::LOCATION, format!("{resource_type}/{id}/_history/{version}")),
            (header::ETAG, format!("W/\"{version}\"")),
        ],
        Json(resource.clone()),
    )
        .into_response()
}

fn check_body(resource_type: &str, body: &Value) -> Result<(), Response> {
    match body.get("resourceType").and_then(Value::as_str) {
        Some(t) if t == resource_type => Ok(()),
        Some(t) => Err(outcome(
            StatusCode::BAD_REQUEST,
            "invalid",
            format!("resourceType {t} does not match endpoint {resource_type}"),
        )),
        None => Err(outcome(StatusCode::BAD_REQUEST, "required", "resourceType is required")),
    }
}

fn matches_filters(resource: &Value, filters: &[(String, String)]) -> bool {
    filters
        .iter()
        .all(|(name, value)| resource.get(name).and_then(Value::as_str) == Some(value.as_str()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn read(State(db): State<Db>, Path((resource_type, id)): Path<(String, String)>) -> Response {
    let store = db.read().await;
    match store
        .resources
        .get(&(resource_type.clone(), id.clone()))
        .and_then(History::current)
    {
        Some(resource) => stored_response(StatusCode::OK, &resource_type, resource),
        None => not_found(&resource_type, &id),
    }
}

async fn vread(
    State(db): State<Db>,
    Path((resource_type, id, version)): Path<(String, String, String)>,
) -> Response {
    let store = db.read().await;
    let found = store
        .resources
        .get(&(resource_type.clone(), id.clone()))
        .and_then(|h| h.versions.iter().find(|v| v["meta"]["versionId"] == json!(version)));
    match found {
        Some(resource) => stored_response(StatusCode::OK, &resource_type, resource),
        None => not_found(&resource_type, &format!("{id}/_history/{version}")),
    }
}

async fn create(
    State(db): State<Db>,
    Path(resource_type): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = check_body(&resource_type, &body) {
        return response;
    }
    let mut store = db.write().await;

    if let Some(key) = header_str(&headers, "idempotency-key") {
        if let Some(existing) = store.idempotency.get(key) {
            if let Some(resource) = store.resources.get(existing).and_then(History::current) {
                tracing::debug!(key, "replayed create");
                return stored_response(StatusCode::CREATED, &resource_type, resource);
            }
        }
    }

    if let Some(condition) = header_str(&headers, "if-none-exist") {
        let filters = condition_pairs(condition);
        if filters.is_empty() {
            return outcome(StatusCode::BAD_REQUEST, "invalid", "empty If-None-Exist");
        }
        let matched: Vec<&Value> = store
            .resources
            .iter()
            .filter(|((t, _), _)| *t == resource_type)
            .filter_map(|(_, h)| h.current())
            .filter(|r| matches_filters(r, &filters))
            .collect();
        match matched.as_slice() {
            [] => {}
            [one] => return stored_response(StatusCode::OK, &resource_type, one),
            _ => {
                return outcome(
                    StatusCode::PRECONDITION_FAILED,
                    "duplicate",
                    "If-None-Exist matched more than one resource",
                )
            }
        }
    }

    let id = Uuid::new_v4().to_string();
    let resource = stamp(body, &id, 1);
    let key = (resource_type.clone(), id.clone());
    store.resources.insert(
        key.clone(),
        History {
            versions: vec![resource.clone()],
            deleted: false,
        },
    );
    if let Some(idempotency_key) = header_str(&headers, "idempotency-key") {
        store.idempotency.insert(idempotency_key.to_string(), key);
    }
    tracing::debug!(%resource_type, %id, "created");
    stored_response(StatusCode::CREATED, &resource_type, &resource)
}

async fn update(
    State(db): State<Db>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = check_body(&resource_type, &body) {
        return response;
    }
    if body.get("id").and_then(Value::as_str) != Some(id.as_str()) {
        return outcome(StatusCode::BAD_REQUEST, "invalid", "body id must match the URL id");
    }
    let mut store = db.write().await;
    let history = store
        .resources
        .entry((resource_type.clone(), id.clone()))
        .or_default();

    if let Some(expected) = header_str(&headers, "if-match") {
        let expected = expected.trim_start_matches("W/").trim_matches('"');
        let current = history
            .current()
            .and_then(|r| r["meta"]["versionId"].as_str())
            .unwrap_or_default();
        if expected != current {
            return outcome(
                StatusCode::PRECONDITION_FAILED,
                "conflict",
                format!("version {expected} is not current (current: {current})"),
            );
        }
    }

    let created = history.current().is_none();
    let resource = stamp(body, &id, history.next_version());
    history.versions.push(resource.clone());
    history.deleted = false;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    tracing::debug!(%resource_type, %id, created, "updated");
    stored_response(status, &resource_type, &resource)
}

async fn delete(
    State(db): State<Db>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Response {
    let mut store = db.write().await;
    match store.resources.get_mut(&(resource_type.clone(), id.clone())) {
        Some(history) if !history.deleted => {
            history.deleted = true;
            StatusCode::NO_CONTENT.into_response()
        }
        _ => not_found(&resource_type, &id),
    }
}

async fn search(
    State(db): State<Db>,
    Path(resource_type): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    let mut count = DEFAULT_PAGE_SIZE;
    let mut offset = 0usize;
    let mut filters = Vec::new();
    for (name, value) in params {
        match name.as_str() {
            "_count" | "_offset" => match value.parse::<usize>() {
                Ok(n) if name == "_count" => count = n.max(1),
                Ok(n) => offset = n,
                Err(_) => {
                    return outcome(StatusCode::BAD_REQUEST, "invalid", format!("{name} must be a number"))
                }
            },
            _ => filters.push((name, value)),
        }
    }

    let store = db.read().await;
    let matched: Vec<&Value> = store
        .resources
        .iter()
        .filter(|((t, _), _)| *t == resource_type)
        .filter_map(|(_, h)| h.current())
        .filter(|r| matches_filters(r, &filters))
        .collect();
    let total = matched.len();
    let page: Vec<Value> = matched
        .into_iter()
        .skip(offset)
        .take(count)
        .map(|r| json!({"resource": r, "search": {"mode": "match"}}))
        .collect();

    let host = header_str(&headers, "host").unwrap_or("localhost");
    let page_url = |offset: usize| {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(filters.iter())
            .append_pair("_count", &count.to_string())
            .append_pair("_offset", &offset.to_string())
            .finish();
        format!("http://{host}/{resource_type}?{query}")
    };
    let mut links = vec![json!({"relation": "self", "url": page_url(offset)})];
    if offset + count < total {
        links.push(json!({"relation": "next", "url": page_url(offset + count)}));
    }

    Json(json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "total": total,
        "link": links,
        "entry": page,
    }))
    .into_response()
}

fn condition_pairs(query: &str) -> Vec<(String, String)> {
    form_urlencoded::parse(query.as_bytes()).into_owned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_sets_id_and_version() {
        let stamped = stamp(json!({"resourceType": "Patient"}), "p1", 3);
        assert_eq!(stamped["id"], "p1");
        assert_eq!(stamped["meta"]["versionId"], "3");
        assert!(stamped["meta"]["lastUpdated"].is_string());
    }

    #[test]
    fn filters_compare_top_level_strings() {
        let resource = json!({"resourceType": "Patient", "gender": "male"});
        assert!(matches_filters(&resource, &[]));
        assert!(matches_filters(&resource, &[("gender".into(), "male".into())]));
        assert!(!matches_filters(&resource, &[("gender".into(), "female".into())]));
        assert!(!matches_filters(&resource, &[("birthDate".into(), "x".into())]));
    }

    #[test]
    fn condition_pairs_are_decoded() {
        let pairs = condition_pairs("identifier=urn%3Amrn%7C42&gender=male");
        assert_eq!(pairs[0], ("identifier".to_string(), "urn:mrn|42".to_string()));
        assert_eq!(pairs[1].1, "male");
        assert!(condition_pairs("").is_empty());
    }

    #[test]
    fn deleted_history_has_no_current_version() {
        let mut history = History::default();
        history.versions.push(json!({"id": "1"}));
        assert!(history.current().is_some());
        history.deleted = true;
        assert!(history.current().is_none());
        assert_eq!(history.next_version(), 2);
    }
}
