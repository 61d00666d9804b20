//! Search queries, result pages and continuation tokens.
//!
//! # Design
//! A search answers with a `Bundle` of type `searchset`. Matched resources
//! and `_include`d resources are kept apart, and the bundle's `next` link
//! is turned into a `PageToken`: the link relative to the client's base
//! URL. The token is opaque to callers and only meaningful to the client
//! that produced it.

use serde::Deserialize;
use serde_json::Value;
use url::{form_urlencoded, Url};

use crate::error::{OperationError, OperationResult};
use crate::resource::ResourceDocument;

/// Ordered search parameters. Repeated names are allowed and kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    params: Vec<(String, String)>,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: &str, value: &str) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    /// Page size hint (`_count`).
    pub fn count(self, n: u32) -> Self {
        self.param("_count", &n.to_string())
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// `application/x-www-form-urlencoded` rendering, e.g.
    /// `family=O%27Brien&_count=10`.
    pub fn to_query_string(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.params.iter())
            .finish()
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for SearchQuery {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            params: iter
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
                .collect(),
        }
    }
}

/// Opaque continuation token for the next page of a search.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageToken(String);

impl PageToken {
    /// Relative path (with query) of the page this token addresses.
    pub fn as_path(&self) -> &str {
        &self.0
    }
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCursor {
    pub resources: Vec<ResourceDocument>,
    pub included: Vec<ResourceDocument>,
    /// Total matches across all pages, when the server reports it.
    pub total: Option<u64>,
    pub next: Option<PageToken>,
}

impl SearchCursor {
    pub fn has_more(&self) -> bool {
        self.next.is_some()
    }

    pub fn next_page(&self) -> Option<&PageToken> {
        self.next.as_ref()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Bundle {
    resource_type: String,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    link: Vec<BundleLink>,
    #[serde(default)]
    entry: Vec<BundleEntry>,
}

#[derive(Deserialize)]
struct BundleLink {
    relation: String,
    url: String,
}

#[derive(Deserialize)]
struct BundleEntry {
    #[serde(default)]
    resource: Option<Value>,
    #[serde(default)]
    search: Option<EntrySearch>,
}

#[derive(Deserialize)]
struct EntrySearch {
    #[serde(default)]
    mode: Option<String>,
}

/// Decode a searchset bundle. `base_url` is used to relativise the `next`
/// link; a link pointing anywhere else is rejected.
pub fn parse_bundle(body: &[u8], base_url: &str) -> OperationResult<SearchCursor> {
    let bundle: Bundle = serde_json::from_slice(body).map_err(OperationError::decode)?;
    if bundle.resource_type != "Bundle" {
        return Err(OperationError::decode(format!(
            "expected a Bundle, got {}",
            bundle.resource_type
        )));
    }

    let mut resources = Vec::new();
    let mut included = Vec::new();
    for entry in bundle.entry {
        let Some(resource) = entry.resource else {
            continue;
        };
        let mode = entry.search.and_then(|s| s.mode);
        match mode.as_deref() {
            None | Some("match") => resources.push(ResourceDocument::from_value(resource)?),
            Some("include") => included.push(ResourceDocument::from_value(resource)?),
            // "outcome" entries carry warnings, not results.
            Some(_) => {}
        }
    }

    let next = bundle
        .link
        .iter()
        .find(|l| l.relation == "next")
        .map(|l| relativize(&l.url, base_url))
        .transpose()?;

    Ok(SearchCursor {
        resources,
        included,
        total: bundle.total,
        next,
    })
}

/// Compare parsed URLs so that spelling differences (host case, an explicit
/// default port) do not matter.
fn relativize(link: &str, base_url: &str) -> OperationResult<PageToken> {
    let outside = || OperationError::decode(format!("next link {link:?} is outside {base_url}"));
    let base = Url::parse(base_url).map_err(OperationError::decode)?;
    let next = Url::parse(link).map_err(|_| outside())?;
    if next.origin() != base.origin() {
        return Err(outside());
    }
    let rest = next
        .path()
        .strip_prefix(base.path().trim_end_matches('/'))
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .ok_or_else(outside)?;
    let mut path = rest.trim_start_matches('/').to_string();
    if let Some(query) = next.query() {
        path.push('?');
        path.push_str(query);
    }
    Ok(PageToken(path))
}
