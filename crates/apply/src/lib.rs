//! Loom apply: writes stamped objects to the store. Mutable objects are upserted at a stable
//! name, immutable objects are created once per distinct body, and immutable history is
//! trimmed to a retention policy.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::time::Instant;

use loom_core::conditions::{ConditionStatus, Reason};
use loom_core::labels::RUN_FINGERPRINT;
use loom_core::model::RetentionPolicy;
use loom_core::obj::{self, Labels};
use loom_core::{ObjectKey, TypeKey};
use loom_store::{ObjectStore, StoreError};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("unable to apply object [{object}]: {source}")]
    Rejected {
        object: String,
        #[source]
        source: StoreError,
    },
    #[error("unable to read [{what}]: {source}")]
    Read {
        what: String,
        #[source]
        source: StoreError,
    },
    #[error("unable to delete object [{key}]: {source}")]
    Delete {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("stamped object must set apiVersion and kind")]
    Untyped,
}

impl ApplyError {
    pub fn reason(&self) -> Reason {
        match self {
            ApplyError::Rejected { .. } | ApplyError::Untyped => Reason::TemplateRejectedByAPIServer,
            ApplyError::Read { .. } | ApplyError::Delete { .. } => Reason::TemplateObjectRetrievalFailure,
        }
    }

    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            ApplyError::Rejected { source, .. } | ApplyError::Read { source, .. } | ApplyError::Delete { source, .. } => {
                Some(source)
            }
            ApplyError::Untyped => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.store_error().map(|e| e.is_retryable()).unwrap_or(false)
    }
}

/// Result of writing one stamped object.
#[derive(Debug, Clone, Default)]
pub struct Applied {
    /// The object as stored.
    pub object: Json,
    /// False when the store already held an equivalent object.
    pub written: bool,
    /// The write created the object rather than patching an existing one.
    pub created: bool,
    /// Immutable only: every object sharing the resource labels, oldest first.
    pub history: Vec<Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0 && self.removes == 0
    }
}

fn describe(doc: &Json) -> String {
    let name = obj::name(doc).or_else(|| obj::generate_name(doc)).unwrap_or("");
    match obj::namespace(doc) {
        Some(ns) => format!("{}/{}/{}", obj::kind(doc).unwrap_or(""), ns, name),
        None => format!("{}/{}", obj::kind(doc).unwrap_or(""), name),
    }
}

fn type_of(doc: &Json) -> Result<TypeKey, ApplyError> {
    match (obj::api_version(doc), obj::kind(doc)) {
        (Some(av), Some(k)) if !av.is_empty() && !k.is_empty() => Ok(TypeKey::new(av, k)),
        _ => Err(ApplyError::Untyped),
    }
}

/// Drop server-populated fields before comparing documents.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for f in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid"] {
            meta.remove(f);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// True when every field set in `desired` holds the same value in `live`.
pub fn contains(live: &Json, desired: &Json) -> bool {
    match (desired, live) {
        (Json::Object(d), Json::Object(l)) => {
            d.iter().all(|(k, dv)| l.get(k).map(|lv| contains(lv, dv)).unwrap_or(dv.is_null()))
        }
        (Json::Array(d), Json::Array(l)) => d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| contains(lv, dv)),
        (d, l) => d == l,
    }
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

fn canonical(v: &Json, h: &mut Sha256) {
    match v {
        Json::Object(m) => {
            let mut keys: Vec<&String> = m.keys().collect();
            keys.sort();
            h.update(b"{");
            for k in keys {
                h.update(Json::String(k.clone()).to_string().as_bytes());
                h.update(b":");
                canonical(&m[k], h);
                h.update(b",");
            }
            h.update(b"}");
        }
        Json::Array(a) => {
            h.update(b"[");
            for x in a {
                canonical(x, h);
                h.update(b",");
            }
            h.update(b"]");
        }
        scalar => h.update(scalar.to_string().as_bytes()),
    }
}

/// SHA-256 over the body of a stamped object. Names, labels, owner references, status and
/// server fields do not take part; annotations do, except the fingerprint itself.
pub fn fingerprint(doc: &Json) -> String {
    let mut body = doc.clone();
    if let Some(m) = body.as_object_mut() {
        m.remove("status");
    }
    if let Some(meta) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.retain(|k, _| k == "annotations");
        let empty = match meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            Some(a) => {
                a.remove(RUN_FINGERPRINT);
                a.is_empty()
            }
            None => true,
        };
        if empty {
            meta.remove("annotations");
        }
    }
    let mut h = Sha256::new();
    canonical(&body, &mut h);
    hex::encode(h.finalize())
}

fn stored_fingerprint(doc: &Json) -> String {
    obj::annotation(doc, RUN_FINGERPRINT).map(str::to_string).unwrap_or_else(|| fingerprint(doc))
}

/// Oldest first; equal creation times order by name.
pub fn by_creation(a: &Json, b: &Json) -> Ordering {
    obj::creation_timestamp(a).cmp(&obj::creation_timestamp(b)).then_with(|| obj::name(a).cmp(&obj::name(b)))
}

/// Newest object accepted by `pred`.
pub fn newest<'a>(objects: &'a [Json], pred: impl Fn(&Json) -> bool) -> Option<&'a Json> {
    objects.iter().filter(|o| pred(o)).max_by(|a, b| by_creation(a, b))
}

/// Create-or-patch `desired` at its stable name. Nothing is written when the live object
/// already contains every desired field.
pub async fn ensure_mutable(store: &dyn ObjectStore, desired: Json) -> Result<Applied, ApplyError> {
    let t0 = Instant::now();
    let key = ObjectKey::of(&desired).ok_or(ApplyError::Untyped)?;
    let live = store.get(&key).await.map_err(|source| ApplyError::Read { what: key.to_string(), source })?;
    let created = live.is_none();
    if let Some(live) = live {
        if contains(&live, &desired) {
            debug!(object = %key, "live object up to date");
            return Ok(Applied { object: live, written: false, created: false, history: Vec::new() });
        }
        let d = diff_summary(&strip_noisy(desired.clone()), &strip_noisy(live));
        debug!(object = %key, adds = d.adds, updates = d.updates, removes = d.removes, "patching");
    }
    match store.patch(desired).await {
        Ok(object) => {
            histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            counter!("apply_ok", 1u64);
            info!(object = %key, "applied");
            Ok(Applied { object, written: true, created, history: Vec::new() })
        }
        Err(source) => {
            counter!("apply_err", 1u64);
            Err(ApplyError::Rejected { object: key.to_string(), source })
        }
    }
}

/// Create `desired` unless an object with an identical body already carries `selector`.
/// The created object is annotated with its fingerprint.
pub async fn ensure_immutable(store: &dyn ObjectStore, mut desired: Json, selector: &Labels) -> Result<Applied, ApplyError> {
    let t0 = Instant::now();
    let ty = type_of(&desired)?;
    let ns = obj::namespace(&desired).map(str::to_string);
    let fp = fingerprint(&desired);
    let mut history = store
        .list(&ty, ns.as_deref(), selector)
        .await
        .map_err(|source| ApplyError::Read { what: ty.to_string(), source })?;
    history.sort_by(by_creation);
    if let Some(found) = history.iter().rev().find(|o| stored_fingerprint(o) == fp) {
        debug!(object = %describe(found), "identical object exists");
        return Ok(Applied { object: found.clone(), written: false, created: false, history });
    }
    obj::merge_annotations(&mut desired, &Labels::from([(RUN_FINGERPRINT.to_string(), fp)]));
    let what = describe(&desired);
    match store.create(desired).await {
        Ok(object) => {
            histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            counter!("apply_ok", 1u64);
            info!(object = %describe(&object), "created");
            history.push(object.clone());
            Ok(Applied { object, written: true, created: true, history })
        }
        Err(source) => {
            counter!("apply_err", 1u64);
            Err(ApplyError::Rejected { object: what, source })
        }
    }
}

/// Objects falling outside `policy`, oldest first. Objects whose outcome is Unknown are
/// still running and always kept.
pub fn retention_victims<'a>(
    objects: &'a [Json],
    policy: &RetentionPolicy,
    outcome: impl Fn(&Json) -> ConditionStatus,
) -> Vec<&'a Json> {
    let mut sorted: Vec<&Json> = objects.iter().collect();
    sorted.sort_by(|a, b| by_creation(a, b));
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    for o in sorted {
        match outcome(o) {
            ConditionStatus::True => succeeded.push(o),
            ConditionStatus::False => failed.push(o),
            ConditionStatus::Unknown => {}
        }
    }
    let excess = |v: &[&'a Json], keep: u32| v.len().saturating_sub(keep as usize);
    let mut victims: Vec<&Json> = Vec::new();
    victims.extend(succeeded.iter().take(excess(&succeeded, policy.max_successful_runs)));
    victims.extend(failed.iter().take(excess(&failed, policy.max_failed_runs)));
    victims.sort_by(|a, b| by_creation(a, b));
    victims
}

/// Delete `key`; an object that is already gone is not an error.
pub async fn delete_object(store: &dyn ObjectStore, key: &ObjectKey) -> Result<bool, ApplyError> {
    match store.delete(key).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(source) => Err(ApplyError::Delete { key: key.clone(), source }),
    }
}

/// Delete the objects falling outside `policy`. Returns how many were removed.
pub async fn enforce_retention(
    store: &dyn ObjectStore,
    objects: &[Json],
    policy: &RetentionPolicy,
    outcome: impl Fn(&Json) -> ConditionStatus,
) -> Result<usize, ApplyError> {
    let mut deleted = 0usize;
    for victim in retention_victims(objects, policy, outcome) {
        let Some(key) = ObjectKey::of(victim) else { continue };
        if delete_object(store, &key).await? {
            deleted += 1;
        }
    }
    if deleted > 0 {
        counter!("runs_gc_deleted", deleted as u64);
        info!(deleted, "retention policy applied");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_store::MemStore;
    use serde_json::json;

    fn run(name: &str, ts: &str, succeeded: Option<bool>) -> Json {
        let mut v = json!({
            "apiVersion": "tekton.dev/v1",
            "kind": "TaskRun",
            "metadata": {"name": name, "namespace": "dev", "creationTimestamp": ts}
        });
        if let Some(ok) = succeeded {
            v["status"] = json!({"conditions": [{"type": "Succeeded", "status": if ok { "True" } else { "False" }}]});
        }
        v
    }

    fn outcome(doc: &Json) -> ConditionStatus {
        obj::condition(doc, "Succeeded").map(|c| c.status).unwrap_or_default()
    }

    fn names(v: &[&Json]) -> Vec<String> {
        v.iter().map(|o| obj::name(o).unwrap_or("").to_string()).collect()
    }

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = json!({
            "metadata": {
                "name": "x",
                "managedFields": [{"foo": "bar"}],
                "resourceVersion": "123",
                "generation": 5,
                "uid": "u",
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": {"obs": true},
            "data": {"k": "v"}
        });
        assert_eq!(strip_noisy(v), json!({"metadata": {"name": "x"}, "data": {"k": "v"}}));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        assert_eq!(diff_summary(&target, &base), DiffSummary { adds: 2, updates: 2, removes: 1 });
        assert!(diff_summary(&base, &base).is_empty());
    }

    #[test]
    fn contains_ignores_extra_live_fields() {
        let live = json!({"metadata": {"name": "cm", "uid": "1"}, "data": {"a": "1", "b": "2"}, "status": {}});
        assert!(contains(&live, &json!({"metadata": {"name": "cm"}, "data": {"a": "1"}})));
        assert!(!contains(&live, &json!({"data": {"a": "2"}})));
        assert!(!contains(&json!({"l": [1, 2]}), &json!({"l": [1]})));
    }

    #[test]
    fn fingerprint_ignores_identity_and_status() {
        let a = json!({
            "kind": "TaskRun",
            "metadata": {"generateName": "t-", "labels": {"x": "1"}, "ownerReferences": [{"uid": "1"}]},
            "spec": {"params": [{"name": "rev", "value": "abc"}]}
        });
        let b = json!({
            "kind": "TaskRun",
            "metadata": {
                "name": "t-xyz",
                "uid": "9",
                "annotations": {RUN_FINGERPRINT: "stale"}
            },
            "spec": {"params": [{"value": "abc", "name": "rev"}]},
            "status": {"conditions": []}
        });
        assert_eq!(fingerprint(&a), fingerprint(&b));
        let c = json!({"kind": "TaskRun", "spec": {"params": [{"name": "rev", "value": "def"}]}});
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn retention_keeps_newest_per_outcome() {
        let objects = vec![
            run("r1", "2024-01-01T00:00:01Z", Some(true)),
            run("r2", "2024-01-01T00:00:02Z", Some(false)),
            run("r3", "2024-01-01T00:00:03Z", Some(true)),
            run("r4", "2024-01-01T00:00:04Z", Some(false)),
            run("r5", "2024-01-01T00:00:05Z", Some(true)),
            run("r6", "2024-01-01T00:00:06Z", Some(false)),
            run("r7", "2024-01-01T00:00:07Z", None),
        ];
        let policy = RetentionPolicy { max_failed_runs: 2, max_successful_runs: 2 };
        assert_eq!(names(&retention_victims(&objects, &policy, outcome)), vec!["r1", "r2"]);
    }

    #[test]
    fn retention_breaks_timestamp_ties_by_name() {
        let objects = vec![
            run("b", "2024-01-01T00:00:01Z", Some(true)),
            run("a", "2024-01-01T00:00:01Z", Some(true)),
            run("c", "2024-01-01T00:00:01Z", Some(true)),
        ];
        let policy = RetentionPolicy { max_failed_runs: 1, max_successful_runs: 1 };
        assert_eq!(names(&retention_victims(&objects, &policy, outcome)), vec!["a", "b"]);
        assert_eq!(newest(&objects, |o| outcome(o) == ConditionStatus::True).and_then(obj::name), Some("c"));
    }

    fn config_map(data: Json) -> Json {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm", "namespace": "dev"}, "data": data})
    }

    #[tokio::test]
    async fn mutable_apply_is_idempotent() {
        let store = MemStore::new();
        let first = ensure_mutable(&store, config_map(json!({"foo": "bar"}))).await.unwrap();
        assert!(first.written && first.created);
        let again = ensure_mutable(&store, config_map(json!({"foo": "bar"}))).await.unwrap();
        assert!(!again.written);
        assert_eq!(obj::meta(&again.object).unwrap()["resourceVersion"], obj::meta(&first.object).unwrap()["resourceVersion"]);
        let changed = ensure_mutable(&store, config_map(json!({"foo": "baz"}))).await.unwrap();
        assert!(changed.written && !changed.created);
        assert_eq!(changed.object["data"]["foo"], "baz");
        assert_eq!(store.current().len(), 1);
    }

    #[tokio::test]
    async fn immutable_apply_creates_once_per_body() {
        let store = MemStore::new();
        let sel = Labels::from([("carto.run/resource-name".to_string(), "tests".to_string())]);
        let body = |rev: &str| {
            json!({
                "apiVersion": "tekton.dev/v1",
                "kind": "TaskRun",
                "metadata": {"generateName": "tests-", "namespace": "dev", "labels": {"carto.run/resource-name": "tests"}},
                "spec": {"rev": rev}
            })
        };
        let a = ensure_immutable(&store, body("1"), &sel).await.unwrap();
        assert!(a.written);
        assert!(obj::annotation(&a.object, RUN_FINGERPRINT).is_some());
        let same = ensure_immutable(&store, body("1"), &sel).await.unwrap();
        assert!(!same.written);
        assert_eq!(obj::name(&same.object), obj::name(&a.object));
        let b = ensure_immutable(&store, body("2"), &sel).await.unwrap();
        assert!(b.written);
        assert_ne!(obj::name(&b.object), obj::name(&a.object));
        assert_eq!(b.history.len(), 2);
        assert_eq!(obj::name(&b.history[1]), obj::name(&b.object));
    }

    #[tokio::test]
    async fn rejected_objects_map_to_api_server_reason() {
        let store = MemStore::new();
        store.reject_kind("ConfigMap", "denied by policy");
        let e = ensure_mutable(&store, config_map(json!({}))).await.unwrap_err();
        assert_eq!(e.reason(), Reason::TemplateRejectedByAPIServer);
        assert!(!e.is_retryable());
        let e = ensure_mutable(&store, json!({"metadata": {"name": "x"}})).await.unwrap_err();
        assert_eq!(e, ApplyError::Untyped);
    }

    #[tokio::test]
    async fn enforce_retention_deletes_victims() {
        let store = MemStore::new();
        let mut stored = Vec::new();
        for (i, ok) in [true, true, true].into_iter().enumerate() {
            let mut r = run(&format!("r{}", i), "", Some(ok));
            if let Some(m) = r["metadata"].as_object_mut() {
                m.remove("creationTimestamp");
            }
            stored.push(store.create(r).await.unwrap());
        }
        let policy = RetentionPolicy { max_failed_runs: 1, max_successful_runs: 1 };
        assert_eq!(enforce_retention(&store, &stored, &policy, outcome).await.unwrap(), 2);
        let left = store.current();
        assert_eq!(left.len(), 1);
        assert!(left.get(&ObjectKey::new("tekton.dev/v1", "TaskRun", Some("dev"), "r2")).is_some());
        assert!(!delete_object(&store, &ObjectKey::new("tekton.dev/v1", "TaskRun", Some("dev"), "r0")).await.unwrap());
    }
}
