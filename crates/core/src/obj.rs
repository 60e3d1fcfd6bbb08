//! Accessors over raw JSON documents.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::conditions::Condition;

pub type Labels = BTreeMap<String, String>;

pub fn meta(doc: &Value) -> Option<&Map<String, Value>> {
    doc.get("metadata").and_then(|m| m.as_object())
}

/// Mutable metadata map, created when missing. Returns `None` for non-object documents.
pub fn meta_mut(doc: &mut Value) -> Option<&mut Map<String, Value>> {
    let obj = doc.as_object_mut()?;
    let m = obj.entry("metadata").or_insert_with(|| Value::Object(Map::new()));
    if !m.is_object() {
        *m = Value::Object(Map::new());
    }
    m.as_object_mut()
}

fn meta_str<'a>(doc: &'a Value, field: &str) -> Option<&'a str> {
    meta(doc)?.get(field)?.as_str()
}

pub fn name(doc: &Value) -> Option<&str> {
    meta_str(doc, "name")
}

pub fn generate_name(doc: &Value) -> Option<&str> {
    meta_str(doc, "generateName")
}

pub fn namespace(doc: &Value) -> Option<&str> {
    meta_str(doc, "namespace").filter(|s| !s.is_empty())
}

pub fn uid(doc: &Value) -> Option<&str> {
    meta_str(doc, "uid")
}

pub fn kind(doc: &Value) -> Option<&str> {
    doc.get("kind").and_then(|v| v.as_str())
}

pub fn api_version(doc: &Value) -> Option<&str> {
    doc.get("apiVersion").and_then(|v| v.as_str())
}

pub fn generation(doc: &Value) -> i64 {
    meta(doc).and_then(|m| m.get("generation")).and_then(|v| v.as_i64()).unwrap_or(0)
}

pub fn observed_generation(doc: &Value) -> Option<i64> {
    doc.get("status").and_then(|s| s.get("observedGeneration")).and_then(|v| v.as_i64())
}

pub fn creation_timestamp(doc: &Value) -> Option<DateTime<Utc>> {
    meta_str(doc, "creationTimestamp")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn string_map(doc: &Value, field: &str) -> Labels {
    meta(doc)
        .and_then(|m| m.get(field))
        .and_then(|v| v.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

pub fn labels(doc: &Value) -> Labels {
    string_map(doc, "labels")
}

pub fn label<'a>(doc: &'a Value, key: &str) -> Option<&'a str> {
    meta(doc)?.get("labels")?.get(key)?.as_str()
}

pub fn annotations(doc: &Value) -> Labels {
    string_map(doc, "annotations")
}

pub fn annotation<'a>(doc: &'a Value, key: &str) -> Option<&'a str> {
    meta(doc)?.get("annotations")?.get(key)?.as_str()
}

/// Merge `extra` into `metadata.<field>`, overwriting existing keys.
fn merge_string_map(doc: &mut Value, field: &str, extra: &Labels) {
    if let Some(m) = meta_mut(doc) {
        let entry = m.entry(field).or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Some(map) = entry.as_object_mut() {
            for (k, v) in extra {
                map.insert(k.clone(), Value::String(v.clone()));
            }
        }
    }
}

pub fn merge_labels(doc: &mut Value, extra: &Labels) {
    merge_string_map(doc, "labels", extra);
}

pub fn merge_annotations(doc: &mut Value, extra: &Labels) {
    merge_string_map(doc, "annotations", extra);
}

/// `status.conditions` parsed leniently; malformed entries are skipped.
pub fn conditions(doc: &Value) -> Vec<Condition> {
    doc.get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .map(|arr| arr.iter().filter_map(|c| serde_json::from_value(c.clone()).ok()).collect())
        .unwrap_or_default()
}

pub fn condition(doc: &Value, type_: &str) -> Option<Condition> {
    conditions(doc).into_iter().find(|c| c.type_ == type_)
}

/// Drop server-populated fields that never belong in a stored body.
pub fn strip_managed_fields(doc: &mut Value) {
    if let Some(m) = doc.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        m.remove("managedFields");
    }
}
