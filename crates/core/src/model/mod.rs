//! Typed documents for the `carto.run` kinds.

mod blueprint;
mod owner;
mod runnable;
mod selector;
mod status;
mod template;

pub use blueprint::*;
pub use owner::*;
pub use runnable::*;
pub use selector::*;
pub use status::*;
pub use template::*;

pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::LoomError;

/// Parse a raw document into one of the typed kinds.
pub fn from_doc<T: DeserializeOwned>(doc: &Value) -> Result<T, LoomError> {
    let kind = doc.get("kind").and_then(|k| k.as_str()).unwrap_or("document");
    let name = crate::obj::name(doc).unwrap_or("");
    serde_json::from_value(doc.clone()).map_err(|e| LoomError::Validation(format!("invalid {} [{}]: {}", kind, name, e)))
}

/// Serialize a typed document back to raw JSON.
pub fn to_doc<T: serde::Serialize>(v: &T) -> Result<Value, LoomError> {
    serde_json::to_value(v).map_err(|e| LoomError::Internal(format!("serializing document: {}", e)))
}
