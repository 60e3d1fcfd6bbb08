//! Loom core types: object keys, resource model, condition catalog and validation.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod conditions;
pub mod error;
pub mod events;
pub mod labels;
pub mod model;
pub mod obj;
pub mod validate;

pub use error::{LoomError, LoomResult};

pub const GROUP: &str = "carto.run";
pub const API_VERSION: &str = "carto.run/v1alpha1";

/// Identity of a document in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }

    /// Key of a loom-owned kind (`carto.run/v1alpha1`).
    pub fn loom(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self::new(API_VERSION, kind, namespace, name)
    }

    /// Key of a raw document, if it carries apiVersion, kind and metadata.name.
    pub fn of(doc: &Value) -> Option<Self> {
        Some(Self {
            api_version: doc.get("apiVersion")?.as_str()?.to_string(),
            kind: doc.get("kind")?.as_str()?.to_string(),
            namespace: obj::namespace(doc).map(|s| s.to_string()),
            name: obj::name(doc)?.to_string(),
        })
    }

    pub fn type_key(&self) -> TypeKey {
        TypeKey { api_version: self.api_version.clone(), kind: self.kind.clone() }
    }

    pub fn named(&self) -> NamespacedName {
        NamespacedName { namespace: self.namespace.clone(), name: self.name.clone() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// apiVersion + kind pair; the unit the store lists and watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeKey {
    pub api_version: String,
    pub kind: String,
}

impl TypeKey {
    pub fn new(api_version: &str, kind: &str) -> Self {
        Self { api_version: api_version.to_string(), kind: kind.to_string() }
    }

    pub fn loom(kind: &str) -> Self {
        Self::new(API_VERSION, kind)
    }

    /// `group/version/Kind` or `version/Kind` for the core group.
    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version, self.kind)
    }

    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.gvk_key())
    }
}

/// Work queue key: `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: Option<String>,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// A change notification from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub key: ObjectKey,
    pub kind: DeltaKind,
    /// Raw object with managed fields stripped.
    pub raw: Value,
}

pub mod prelude {
    pub use super::conditions::{Condition, ConditionStatus, ConditionType, Reason};
    pub use super::model::*;
    pub use super::{Delta, DeltaKind, LoomError, LoomResult, NamespacedName, ObjectKey, TypeKey, API_VERSION};
}
