//! Resource documents and references.
//!
//! # Design
//! `ResourceDocument` keeps the full JSON object in field order (serde_json's
//! `preserve_order`) so fields the client does not model survive a round
//! trip untouched. The only invariant enforced at construction is a string
//! `resourceType`. Documents are values: the `with_*` builders return a new
//! document and never mutate in place.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OperationError, OperationResult};

const MAX_ID_LEN: usize = 64;

/// One resource instance as exchanged with the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct ResourceDocument {
    fields: Map<String, Value>,
}

impl ResourceDocument {
    /// An empty document of the given type.
    pub fn new(resource_type: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("resourceType".to_string(), Value::String(resource_type.to_string()));
        Self { fields }
    }

    /// Wrap a JSON value, checking that it is an object with a string
    /// `resourceType`.
    pub fn from_value(value: Value) -> OperationResult<Self> {
        match value {
            Value::Object(fields) => match fields.get("resourceType") {
                Some(Value::String(t)) if !t.is_empty() => Ok(Self { fields }),
                _ => Err(OperationError::decode("document has no resourceType")),
            },
            other => Err(OperationError::decode(format!(
                "expected a JSON object, found {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> OperationResult<Self> {
        let value: Value = serde_json::from_slice(bytes).map_err(OperationError::decode)?;
        Self::from_value(value)
    }

    pub fn from_typed<T: Resource>(resource: &T) -> OperationResult<Self> {
        let value = serde_json::to_value(resource).map_err(|e| OperationError::invalid_input(e.to_string()))?;
        let document = Self::from_value(value).map_err(|e| OperationError::invalid_input(e.to_string()))?;
        if document.resource_type() != T::RESOURCE_TYPE {
            return Err(OperationError::invalid_input(format!(
                "{} serialized with resourceType {}",
                T::RESOURCE_TYPE,
                document.resource_type()
            )));
        }
        Ok(document)
    }

    pub fn to_typed<T: Resource>(&self) -> OperationResult<T> {
        if self.resource_type() != T::RESOURCE_TYPE {
            return Err(OperationError::decode(format!(
                "expected {}, got {}",
                T::RESOURCE_TYPE,
                self.resource_type()
            )));
        }
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(OperationError::decode)
    }

    pub fn resource_type(&self) -> &str {
        self.fields
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn id(&self) -> Option<&str> {
        self.fields.get("id").and_then(Value::as_str)
    }

    pub fn version_id(&self) -> Option<&str> {
        self.meta_str("versionId")
    }

    /// `meta.lastUpdated`, if present and a valid instant.
    pub fn last_updated(&self) -> Option<DateTime<FixedOffset>> {
        self.meta_str("lastUpdated")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.fields.get("meta")?.get(key)?.as_str()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// The reference this document is stored under, once it has an id.
    pub fn reference(&self) -> Option<ResourceReference> {
        ResourceReference::new(self.resource_type(), self.id()?).ok()
    }

    pub fn with_field(&self, name: &str, value: impl Into<Value>) -> Self {
        let mut fields = self.fields.clone();
        fields.insert(name.to_string(), value.into());
        Self { fields }
    }

    pub fn with_id(&self, id: &str) -> Self {
        self.with_field("id", id)
    }

    /// Copy with `meta.versionId` set, keeping any other meta fields.
    pub fn with_version_id(&self, version_id: &str) -> Self {
        let mut fields = self.fields.clone();
        let meta = fields
            .entry("meta")
            .or_insert_with(|| Value::Object(Map::new()));
        if !meta.is_object() {
            *meta = Value::Object(Map::new());
        }
        if let Value::Object(meta) = meta {
            meta.insert("versionId".to_string(), Value::String(version_id.to_string()));
        }
        Self { fields }
    }

    /// True when every field of `other` except server-managed `id` and
    /// `meta` appears here with an equal value.
    pub fn contains_fields_of(&self, other: &ResourceDocument) -> bool {
        other
            .fields
            .iter()
            .filter(|(k, _)| k.as_str() != "id" && k.as_str() != "meta")
            .all(|(k, v)| self.fields.get(k) == Some(v))
    }

    pub fn to_bytes(&self) -> OperationResult<Vec<u8>> {
        serde_json::to_vec(&self.fields).map_err(|e| OperationError::invalid_input(e.to_string()))
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl TryFrom<Value> for ResourceDocument {
    type Error = OperationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<ResourceDocument> for Value {
    fn from(document: ResourceDocument) -> Self {
        document.into_value()
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A `(resource type, id)` pair naming one document on the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceReference {
    resource_type: String,
    id: String,
}

impl ResourceReference {
    pub fn new(resource_type: &str, id: &str) -> OperationResult<Self> {
        validate_resource_type(resource_type)?;
        validate_id(id)?;
        Ok(Self {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
        })
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Relative path of the referenced document, e.g. `Patient/123`.
    pub fn path(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for ResourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

impl FromStr for ResourceReference {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (resource_type, id) = s
            .split_once('/')
            .ok_or_else(|| OperationError::invalid_input(format!("reference {s:?} is not Type/id")))?;
        Self::new(resource_type, id)
    }
}

/// Resource type names are capitalised ASCII words, e.g. `Patient`.
pub fn validate_resource_type(resource_type: &str) -> OperationResult<()> {
    let mut chars = resource_type.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphabetic());
    if valid {
        Ok(())
    } else {
        Err(OperationError::invalid_input(format!(
            "invalid resource type {resource_type:?}"
        )))
    }
}

/// Ids are 1-64 characters of `[A-Za-z0-9.-]`, which are all URL-safe.
pub fn validate_id(id: &str) -> OperationResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(OperationError::invalid_input(format!("invalid resource id {id:?}")))
    }
}

/// A strongly typed resource that maps onto a `ResourceDocument`.
///
/// The serialized form must include `resourceType` equal to
/// `RESOURCE_TYPE`.
pub trait Resource: Serialize + DeserializeOwned {
    const RESOURCE_TYPE: &'static str;
}
