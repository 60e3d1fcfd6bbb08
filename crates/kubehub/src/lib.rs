//! Loom kubehub: a Kubernetes-backed `ObjectStore` over `DynamicObject`, with cached
//! discovery, list+watch delta fan-out, service-account impersonation and owner events.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, ServiceAccount};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter},
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Client, Config,
};
use loom_core::events::OwnerEvent;
use loom_core::obj::{self, Labels};
use loom_core::{Delta, DeltaKind, ObjectKey, TypeKey};
use loom_store::{service_account_key, EventRecorder, ObjectStore, StoreError, StoreProvider};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

pub const FIELD_MANAGER: &str = "loom";

fn gvk_of(ty: &TypeKey) -> GroupVersionKind {
    let (group, version) = ty.group_version();
    GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: ty.kind.clone() }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn map_err(e: kube::Error, key: &ObjectKey) -> StoreError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => StoreError::NotFound(key.clone()),
            409 => StoreError::Conflict(resp.message),
            401 | 403 => StoreError::Forbidden(resp.message),
            400 | 422 => StoreError::Invalid(resp.message),
            _ => StoreError::Transport(format!("{} ({})", resp.message, resp.code)),
        },
        other => StoreError::Transport(other.to_string()),
    }
}

fn to_value(o: &DynamicObject) -> Result<Value, StoreError> {
    let mut raw = serde_json::to_value(o).map_err(|e| StoreError::Transport(format!("serializing object: {}", e)))?;
    obj::strip_managed_fields(&mut raw);
    Ok(raw)
}

fn to_dynamic(doc: Value) -> Result<DynamicObject, StoreError> {
    serde_json::from_value(doc).map_err(|e| StoreError::Invalid(format!("not a kubernetes object: {}", e)))
}

// Stamped documents inherit the owner namespace; cluster-scoped kinds must not carry one.
fn fit_scope(mut doc: Value, namespaced: bool) -> Value {
    if !namespaced {
        if let Some(m) = obj::meta_mut(&mut doc) {
            m.remove("namespace");
        }
    }
    doc
}

fn object_reference(owner: &Value) -> ObjectReference {
    ObjectReference {
        api_version: obj::api_version(owner).map(str::to_string),
        kind: obj::kind(owner).map(str::to_string),
        name: obj::name(owner).map(str::to_string),
        namespace: obj::namespace(owner).map(str::to_string),
        uid: obj::uid(owner).map(str::to_string),
        ..Default::default()
    }
}

fn label_selector(labels: &Labels) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

fn delta_from(ty: &TypeKey, o: &DynamicObject, kind: DeltaKind) -> Result<Delta> {
    let name = o.metadata.name.as_deref().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let mut raw = serde_json::to_value(o).context("serializing DynamicObject")?;
    obj::strip_managed_fields(&mut raw);
    if let Some(m) = raw.as_object_mut() {
        m.insert("apiVersion".into(), Value::String(ty.api_version.clone()));
        m.insert("kind".into(), Value::String(ty.kind.clone()));
    }
    let key = ObjectKey::new(&ty.api_version, &ty.kind, o.metadata.namespace.as_deref(), name);
    Ok(Delta { key, kind, raw })
}

struct Shared {
    config: Config,
    resources: RwLock<FxHashMap<TypeKey, (ApiResource, bool)>>,
    watched: Mutex<FxHashSet<TypeKey>>,
    deltas: broadcast::Sender<Delta>,
    impersonated: Mutex<FxHashMap<(String, String), Client>>,
}

/// Object store backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    shared: Arc<Shared>,
}

impl KubeStore {
    /// Connect with the inferred kubeconfig or in-cluster configuration.
    pub async fn try_default() -> Result<Self> {
        let config = Config::infer().await.context("inferring kube config")?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let client = Client::try_from(config.clone()).context("building kube client")?;
        let (deltas, _) = broadcast::channel(4096);
        Ok(Self {
            client,
            shared: Arc::new(Shared {
                config,
                resources: RwLock::new(FxHashMap::default()),
                watched: Mutex::new(FxHashSet::default()),
                deltas,
                impersonated: Mutex::new(FxHashMap::default()),
            }),
        })
    }

    async fn resource(&self, ty: &TypeKey) -> Result<(ApiResource, bool), StoreError> {
        if let Some(found) = self.shared.resources.read().await.get(ty) {
            return Ok(found.clone());
        }
        let found = find_api_resource(self.client.clone(), &gvk_of(ty))
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        self.shared.resources.write().await.insert(ty.clone(), found.clone());
        Ok(found)
    }

    async fn api(&self, ty: &TypeKey, namespace: Option<&str>) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.resource(ty).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }

    /// The API for `doc`, its key, and `doc` without a namespace when its kind is cluster-scoped.
    async fn api_for(&self, doc: Value) -> Result<(Api<DynamicObject>, ObjectKey, Value), StoreError> {
        let ty = match (obj::api_version(&doc), obj::kind(&doc)) {
            (Some(av), Some(k)) => TypeKey::new(av, k),
            _ => return Err(StoreError::Invalid("apiVersion and kind are required".into())),
        };
        let (_, namespaced) = self.resource(&ty).await?;
        let doc = fit_scope(doc, namespaced);
        // generateName: only the type and namespace are needed to post.
        let key = ObjectKey::new(&ty.api_version, &ty.kind, obj::namespace(&doc), obj::name(&doc).unwrap_or(""));
        let api = self.api(&ty, key.namespace.as_deref()).await?;
        Ok((api, key, doc))
    }

    fn publish(&self, ty: &TypeKey, ev: Event<DynamicObject>) {
        let batch = match ev {
            Event::Applied(o) => vec![delta_from(ty, &o, DeltaKind::Applied)],
            Event::Deleted(o) => vec![delta_from(ty, &o, DeltaKind::Deleted)],
            Event::Restarted(list) => {
                debug!(gvk = %ty, count = list.len(), "watch restart");
                counter!("kube_watch_restarts", 1u64);
                list.iter().map(|o| delta_from(ty, o, DeltaKind::Applied)).collect()
            }
        };
        for d in batch {
            match d {
                Ok(d) => {
                    let _ = self.shared.deltas.send(d);
                }
                Err(e) => warn!(gvk = %ty, error = %e, "skipping watch event"),
            }
        }
    }

    // Watch errors are retried with backoff; the stream only ends if the watcher does.
    async fn run_watcher(&self, ty: &TypeKey) -> Result<()> {
        let api = self.api(ty, None).await.map_err(|e| anyhow!(e.to_string()))?;
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        info!(gvk = %ty, "watcher started");
        while let Some(ev) = stream.next().await {
            match ev {
                Ok(ev) => self.publish(ty, ev),
                Err(e) => {
                    counter!("kube_watch_errors", 1u64);
                    warn!(gvk = %ty, error = %e, "watch error; retrying");
                }
            }
        }
        warn!(gvk = %ty, "watcher stream ended");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, StoreError> {
        let api = self.api(&key.type_key(), key.namespace.as_deref()).await?;
        match api.get_opt(&key.name).await.map_err(|e| map_err(e, key))? {
            Some(o) => to_value(&o).map(Some),
            None => Ok(None),
        }
    }

    async fn list(&self, ty: &TypeKey, namespace: Option<&str>, labels: &Labels) -> Result<Vec<Value>, StoreError> {
        let api = self.api(ty, namespace).await?;
        let mut lp = ListParams::default();
        if !labels.is_empty() {
            lp = lp.labels(&label_selector(labels));
        }
        let list = api.list(&lp).await.map_err(|e| map_err(e, &ObjectKey::new(&ty.api_version, &ty.kind, namespace, "")))?;
        list.items
            .iter()
            .map(|o| {
                let mut v = to_value(o)?;
                if let Some(m) = v.as_object_mut() {
                    m.insert("apiVersion".into(), Value::String(ty.api_version.clone()));
                    m.insert("kind".into(), Value::String(ty.kind.clone()));
                }
                Ok(v)
            })
            .collect()
    }

    async fn create(&self, doc: Value) -> Result<Value, StoreError> {
        let (api, key, doc) = self.api_for(doc).await?;
        let created = api.create(&PostParams::default(), &to_dynamic(doc)?).await.map_err(|e| map_err(e, &key))?;
        to_value(&created)
    }

    async fn update(&self, doc: Value) -> Result<Value, StoreError> {
        let (api, key, doc) = self.api_for(doc).await?;
        let replaced = api.replace(&key.name, &PostParams::default(), &to_dynamic(doc)?).await.map_err(|e| map_err(e, &key))?;
        to_value(&replaced)
    }

    async fn patch(&self, doc: Value) -> Result<Value, StoreError> {
        let (api, key, doc) = self.api_for(doc).await?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let patched = api.patch(&key.name, &pp, &Patch::Apply(&doc)).await.map_err(|e| map_err(e, &key))?;
        to_value(&patched)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let api = self.api(&key.type_key(), key.namespace.as_deref()).await?;
        api.delete(&key.name, &DeleteParams::background()).await.map(|_| ()).map_err(|e| map_err(e, key))
    }

    async fn update_status(&self, doc: Value) -> Result<Value, StoreError> {
        let (api, key, doc) = self.api_for(doc).await?;
        let body = serde_json::to_vec(&doc).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let replaced = api.replace_status(&key.name, &PostParams::default(), body).await.map_err(|e| map_err(e, &key))?;
        to_value(&replaced)
    }

    async fn watch(&self, ty: &TypeKey) -> Result<(), StoreError> {
        let fresh = self.shared.watched.lock().unwrap_or_else(|e| e.into_inner()).insert(ty.clone());
        if fresh {
            self.resource(ty).await?;
            let me = self.clone();
            let ty = ty.clone();
            tokio::spawn(async move {
                if let Err(e) = me.run_watcher(&ty).await {
                    warn!(gvk = %ty, error = %e, "watcher failed");
                }
                // Let the next watch request start it again.
                me.shared.watched.lock().unwrap_or_else(|e| e.into_inner()).remove(&ty);
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Delta> {
        self.shared.deltas.subscribe()
    }
}

#[async_trait::async_trait]
impl StoreProvider for KubeStore {
    /// A handle impersonating `system:serviceaccount:<namespace>:<name>`.
    async fn for_service_account(&self, namespace: &str, name: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
        let sa = service_account_key(namespace, name);
        let sas: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        if sas.get_opt(name).await.map_err(|e| map_err(e, &sa))?.is_none() {
            return Err(StoreError::NotFound(sa));
        }
        let id = (namespace.to_string(), name.to_string());
        let cached = self.shared.impersonated.lock().unwrap_or_else(|e| e.into_inner()).get(&id).cloned();
        let client = match cached {
            Some(c) => c,
            None => {
                let mut config = self.shared.config.clone();
                config.auth_info.impersonate = Some(format!("system:serviceaccount:{}:{}", namespace, name));
                let c = Client::try_from(config).map_err(|e| StoreError::Transport(e.to_string()))?;
                self.shared.impersonated.lock().unwrap_or_else(|e| e.into_inner()).insert(id, c.clone());
                c
            }
        };
        Ok(Arc::new(KubeStore { client, shared: Arc::clone(&self.shared) }))
    }
}

#[async_trait::async_trait]
impl EventRecorder for KubeStore {
    async fn record(&self, owner: &Value, event: &OwnerEvent) -> Result<(), StoreError> {
        let reporter = Reporter { controller: FIELD_MANAGER.to_string(), instance: std::env::var("HOSTNAME").ok() };
        let recorder = Recorder::new(self.client.clone(), reporter, object_reference(owner));
        let ev = KubeEvent {
            type_: EventType::Normal,
            reason: event.reason.as_str().to_string(),
            note: Some(event.note.clone()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        recorder.publish(ev).await.map_err(|e| StoreError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_from_type_key() {
        let g = gvk_of(&TypeKey::new("apps/v1", "Deployment"));
        assert_eq!((g.group.as_str(), g.version.as_str(), g.kind.as_str()), ("apps", "v1", "Deployment"));
        let core = gvk_of(&TypeKey::new("v1", "ConfigMap"));
        assert!(core.group.is_empty());
    }

    #[test]
    fn selector_string_joins_pairs() {
        let mut l = Labels::new();
        l.insert("carto.run/workload-name".into(), "app".into());
        l.insert("carto.run/resource-name".into(), "src".into());
        assert_eq!(label_selector(&l), "carto.run/resource-name=src,carto.run/workload-name=app");
    }

    #[test]
    fn api_errors_map_to_store_errors() {
        let resp = |code: u16, reason: &str| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "m".into(),
                reason: reason.into(),
                code,
            })
        };
        let key = ObjectKey::new("v1", "ConfigMap", Some("dev"), "cm");
        assert!(map_err(resp(409, "Conflict"), &key).is_retryable());
        assert_eq!(map_err(resp(403, "Forbidden"), &key), StoreError::Forbidden("m".into()));
        assert_eq!(map_err(resp(422, "Invalid"), &key), StoreError::Invalid("m".into()));
        assert!(map_err(resp(500, "InternalError"), &key).is_retryable());
    }

    #[tokio::test]
    async fn unreadable_watch_objects_are_skipped() {
        let config = Config::new("http://127.0.0.1:6443".parse().unwrap());
        let store = KubeStore::from_config(config).unwrap();
        let mut rx = store.subscribe();
        let ty = TypeKey::new("v1", "ConfigMap");
        let nameless: DynamicObject = serde_json::from_value(serde_json::json!({"metadata": {}})).unwrap();
        let cm: DynamicObject = serde_json::from_value(serde_json::json!({"metadata": {"name": "cm", "namespace": "dev"}})).unwrap();
        store.publish(&ty, Event::Restarted(vec![nameless, cm]));
        let d = rx.try_recv().unwrap();
        assert_eq!(d.key, ObjectKey::new("v1", "ConfigMap", Some("dev"), "cm"));
        assert_eq!(d.raw["kind"], "ConfigMap");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cluster_scoped_documents_drop_the_namespace() {
        let doc = serde_json::json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "team-a", "namespace": "dev"}});
        assert!(obj::namespace(&fit_scope(doc.clone(), false)).is_none());
        assert_eq!(obj::namespace(&fit_scope(doc, true)), Some("dev"));
    }

    #[test]
    fn missing_objects_are_not_found() {
        let resp = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "configmaps \"cm\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        let key = ObjectKey::new("v1", "ConfigMap", Some("dev"), "cm");
        assert_eq!(map_err(resp, &key), StoreError::NotFound(key));
    }

    #[test]
    fn events_reference_the_owner() {
        let owner = serde_json::json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "Workload",
            "metadata": {"name": "app", "namespace": "dev", "uid": "u-1"}
        });
        let r = object_reference(&owner);
        assert_eq!(r.kind.as_deref(), Some("Workload"));
        assert_eq!(r.namespace.as_deref(), Some("dev"));
        assert_eq!(r.uid.as_deref(), Some("u-1"));
        assert!(r.field_path.is_none());
    }
}
