//! Typed resources.
//!
//! # Design
//! Only the fields callers commonly touch are modelled. Everything else is
//! captured in `extra` so converting a fetched document to a typed value and
//! back does not drop server data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::resource::Resource;

/// Administrative gender as FHIR codes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HumanName {
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub given: Vec<String>,
}

/// The `resourceType` discriminator of a `Patient`; rejects any other type
/// during deserialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatientType {
    #[default]
    Patient,
}

/// A Patient resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub resource_type: PatientType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub name: Vec<HumanName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Patient {
    pub fn new() -> Self {
        Self {
            resource_type: PatientType::Patient,
            id: None,
            name: Vec::new(),
            gender: None,
            birth_date: None,
            extra: Map::new(),
        }
    }
}

impl Default for Patient {
    fn default() -> Self {
        Self::new()
    }
}

impl Resource for Patient {
    const RESOURCE_TYPE: &'static str = "Patient";
}
