use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use loom_core::events::OwnerEvent;
use loom_core::obj::{self, Labels};
use loom_core::{Delta, DeltaKind, ObjectKey, TypeKey};
use rand::Rng;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use crate::{service_account_key, EventRecorder, ObjectStore, StoreError, StoreProvider};

const SUFFIX_CHARS: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Immutable view of every stored object at one epoch.
#[derive(Debug, Clone, Default)]
pub struct World {
    pub epoch: u64,
    resource_version: u64,
    last_created: Option<DateTime<Utc>>,
    objects: FxHashMap<ObjectKey, Value>,
}

impl World {
    pub fn get(&self, key: &ObjectKey) -> Option<&Value> {
        self.objects.get(key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &Value)> {
        self.objects.iter()
    }

    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    // Strictly increasing so creation order is total even within one millisecond.
    fn creation_time(&mut self) -> String {
        let mut t = Utc::now();
        if let Some(last) = self.last_created {
            if t <= last {
                t = last + Duration::milliseconds(1);
            }
        }
        self.last_created = Some(t);
        t.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

struct Inner {
    snap: ArcSwap<World>,
    write: Mutex<()>,
    epoch_tx: watch::Sender<u64>,
    deltas: broadcast::Sender<Delta>,
    rejected: Mutex<FxHashMap<String, String>>,
    events: Mutex<Vec<(ObjectKey, OwnerEvent)>>,
}

/// In-memory object store. Writers are serialized and publish a fresh `World` snapshot;
/// readers never block.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<Inner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

fn spec_part(doc: &Value) -> Value {
    let mut v = doc.clone();
    if let Some(m) = v.as_object_mut() {
        m.remove("metadata");
        m.remove("status");
    }
    v
}

fn meta_field<'a>(doc: &'a Value, field: &str) -> Option<&'a Value> {
    obj::meta(doc).and_then(|m| m.get(field))
}

fn set_meta(doc: &mut Value, field: &str, value: Value) {
    if let Some(m) = obj::meta_mut(doc) {
        m.insert(field.to_string(), value);
    }
}

/// RFC 7386 merge patch: objects merge recursively, `null` removes, everything else replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(t), Some(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                } else {
                    merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

fn key_of(doc: &Value) -> Result<ObjectKey, StoreError> {
    ObjectKey::of(doc).ok_or_else(|| StoreError::Invalid("apiVersion, kind and metadata.name are required".into()))
}

fn check_version(doc: &Value, stored: &Value, key: &ObjectKey) -> Result<(), StoreError> {
    match meta_field(doc, "resourceVersion").and_then(|v| v.as_str()) {
        Some(rv) if Some(rv) != meta_field(stored, "resourceVersion").and_then(|v| v.as_str()) => Err(StoreError::Conflict(
            format!("the object {} has been modified; please apply your changes to the latest version", key),
        )),
        _ => Ok(()),
    }
}

fn labels_match(doc: &Value, labels: &Labels) -> bool {
    labels.iter().all(|(k, v)| obj::label(doc, k) == Some(v.as_str()))
}

impl MemStore {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        let (deltas, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                snap: ArcSwap::from_pointee(World::default()),
                write: Mutex::new(()),
                epoch_tx,
                deltas,
                rejected: Mutex::new(FxHashMap::default()),
                events: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn current(&self) -> Arc<World> {
        self.inner.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.inner.epoch_tx.subscribe()
    }

    /// Make every subsequent create or update of `kind` fail as an admission rejection.
    pub fn reject_kind(&self, kind: &str, message: &str) {
        self.inner.rejected.lock().unwrap_or_else(|e| e.into_inner()).insert(kind.to_string(), message.to_string());
    }

    /// Events recorded against `owner`, oldest first.
    pub fn events(&self, owner: &ObjectKey) -> Vec<OwnerEvent> {
        let events = self.inner.events.lock().unwrap_or_else(|e| e.into_inner());
        events.iter().filter(|(k, _)| k == owner).map(|(_, e)| e.clone()).collect()
    }

    fn check_admission(&self, doc: &Value) -> Result<(), StoreError> {
        let rejected = self.inner.rejected.lock().unwrap_or_else(|e| e.into_inner());
        match obj::kind(doc).and_then(|k| rejected.get(k)) {
            Some(msg) => Err(StoreError::Invalid(msg.clone())),
            None => Ok(()),
        }
    }

    /// Run one write against a private copy of the world and publish it with its deltas.
    fn mutate<R>(&self, f: impl FnOnce(&mut World) -> Result<(R, Vec<Delta>), StoreError>) -> Result<R, StoreError> {
        let _guard = self.inner.write.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (*self.inner.snap.load_full()).clone();
        let (out, deltas) = f(&mut next)?;
        if deltas.is_empty() {
            return Ok(out);
        }
        next.epoch = next.epoch.saturating_add(1);
        let epoch = next.epoch;
        self.inner.snap.store(Arc::new(next));
        let _ = self.inner.epoch_tx.send(epoch);
        for d in deltas {
            trace!(key = %d.key, kind = ?d.kind, epoch, "store delta");
            let _ = self.inner.deltas.send(d);
        }
        Ok(out)
    }

    fn insert_new(world: &mut World, mut doc: Value) -> Result<(Value, Vec<Delta>), StoreError> {
        let mut name = obj::name(&doc).unwrap_or("").to_string();
        if name.is_empty() {
            let prefix = obj::generate_name(&doc)
                .filter(|g| !g.is_empty())
                .ok_or_else(|| StoreError::Invalid("metadata.name or metadata.generateName is required".into()))?
                .to_string();
            let mut rng = rand::thread_rng();
            loop {
                let suffix: String =
                    (0..5).map(|_| SUFFIX_CHARS[rng.gen_range(0..SUFFIX_CHARS.len())] as char).collect();
                name = format!("{}{}", prefix, suffix);
                let candidate = ObjectKey::new(
                    obj::api_version(&doc).unwrap_or(""),
                    obj::kind(&doc).unwrap_or(""),
                    obj::namespace(&doc),
                    &name,
                );
                if !world.objects.contains_key(&candidate) {
                    break;
                }
            }
            set_meta(&mut doc, "name", Value::String(name));
        }
        let key = key_of(&doc)?;
        if world.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        let rv = world.next_resource_version();
        let created = world.creation_time();
        set_meta(&mut doc, "uid", Value::String(uuid::Uuid::new_v4().to_string()));
        set_meta(&mut doc, "resourceVersion", Value::String(rv));
        set_meta(&mut doc, "generation", Value::from(1));
        set_meta(&mut doc, "creationTimestamp", Value::String(created));
        world.objects.insert(key.clone(), doc.clone());
        debug!(key = %key, "created");
        Ok((doc.clone(), vec![Delta { key, kind: DeltaKind::Applied, raw: doc }]))
    }

    /// Store `next` over `prev` unless nothing changed; bumps generation when the spec moved.
    fn replace(world: &mut World, key: ObjectKey, prev: &Value, mut next: Value) -> (Value, Vec<Delta>) {
        for field in ["uid", "creationTimestamp", "resourceVersion", "generation"] {
            if let Some(v) = meta_field(prev, field) {
                set_meta(&mut next, field, v.clone());
            }
        }
        if next == *prev {
            return (next, Vec::new());
        }
        if spec_part(&next) != spec_part(prev) {
            set_meta(&mut next, "generation", Value::from(obj::generation(prev) + 1));
        }
        let rv = world.next_resource_version();
        set_meta(&mut next, "resourceVersion", Value::String(rv));
        world.objects.insert(key.clone(), next.clone());
        (next.clone(), vec![Delta { key, kind: DeltaKind::Applied, raw: next }])
    }

    fn cascade(world: &mut World, key: &ObjectKey) -> Vec<Delta> {
        let mut out = Vec::new();
        let mut pending = vec![key.clone()];
        while let Some(k) = pending.pop() {
            let Some(doc) = world.objects.remove(&k) else { continue };
            if let Some(uid) = obj::uid(&doc) {
                pending.extend(
                    world
                        .objects
                        .iter()
                        .filter(|(_, o)| owned_by(o, uid))
                        .map(|(child, _)| child.clone()),
                );
            }
            out.push(Delta { key: k, kind: DeltaKind::Deleted, raw: doc });
        }
        out
    }
}

fn owned_by(doc: &Value, uid: &str) -> bool {
    meta_field(doc, "ownerReferences")
        .and_then(|r| r.as_array())
        .map(|refs| refs.iter().any(|r| r.get("uid").and_then(|u| u.as_str()) == Some(uid)))
        .unwrap_or(false)
}

#[async_trait::async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, StoreError> {
        Ok(self.current().get(key).cloned())
    }

    async fn list(&self, ty: &TypeKey, namespace: Option<&str>, labels: &Labels) -> Result<Vec<Value>, StoreError> {
        let world = self.current();
        let mut out: Vec<(&ObjectKey, &Value)> = world
            .iter()
            .filter(|(k, v)| {
                k.api_version == ty.api_version
                    && k.kind == ty.kind
                    && namespace.map(|ns| k.namespace.as_deref() == Some(ns)).unwrap_or(true)
                    && labels_match(v, labels)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        Ok(out.into_iter().map(|(_, v)| v.clone()).collect())
    }

    async fn create(&self, doc: Value) -> Result<Value, StoreError> {
        self.check_admission(&doc)?;
        self.mutate(|w| Self::insert_new(w, doc))
    }

    async fn update(&self, doc: Value) -> Result<Value, StoreError> {
        self.check_admission(&doc)?;
        let key = key_of(&doc)?;
        self.mutate(|w| {
            let prev = w.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
            check_version(&doc, &prev, &key)?;
            let mut next = doc;
            match (next.as_object_mut(), prev.get("status")) {
                (Some(m), Some(status)) => {
                    m.insert("status".into(), status.clone());
                }
                (Some(m), None) => {
                    m.remove("status");
                }
                _ => {}
            }
            Ok(Self::replace(w, key, &prev, next))
        })
    }

    async fn patch(&self, doc: Value) -> Result<Value, StoreError> {
        self.check_admission(&doc)?;
        let key = key_of(&doc)?;
        self.mutate(|w| match w.objects.get(&key).cloned() {
            None => Self::insert_new(w, doc),
            Some(prev) => {
                let mut patch = doc;
                if let Some(m) = patch.as_object_mut() {
                    m.remove("status");
                }
                let mut next = prev.clone();
                merge_patch(&mut next, &patch);
                Ok(Self::replace(w, key, &prev, next))
            }
        })
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.mutate(|w| {
            if !w.objects.contains_key(key) {
                return Err(StoreError::NotFound(key.clone()));
            }
            Ok(((), Self::cascade(w, key)))
        })
    }

    async fn update_status(&self, doc: Value) -> Result<Value, StoreError> {
        let key = key_of(&doc)?;
        self.mutate(|w| {
            let prev = w.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
            check_version(&doc, &prev, &key)?;
            let mut next = prev.clone();
            if let Some(m) = next.as_object_mut() {
                match doc.get("status") {
                    Some(s) => m.insert("status".into(), s.clone()),
                    None => m.remove("status"),
                };
            }
            Ok(Self::replace(w, key, &prev, next))
        })
    }

    async fn watch(&self, _ty: &TypeKey) -> Result<(), StoreError> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Delta> {
        self.inner.deltas.subscribe()
    }
}

#[async_trait::async_trait]
impl StoreProvider for MemStore {
    async fn for_service_account(&self, namespace: &str, name: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
        let key = service_account_key(namespace, name);
        if self.current().get(&key).is_none() {
            return Err(StoreError::NotFound(key));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait::async_trait]
impl EventRecorder for MemStore {
    async fn record(&self, owner: &Value, event: &OwnerEvent) -> Result<(), StoreError> {
        let key = key_of(owner)?;
        debug!(owner = %key, reason = %event.reason, note = %event.note, "event");
        self.inner.events.lock().unwrap_or_else(|e| e.into_inner()).push((key, event.clone()));
        Ok(())
    }
}
