//! Which reconciles a store change should trigger.

use loom_core::labels::{owner_name_key, owner_namespace_key, RUNNABLE_NAME};
use loom_core::model::{from_doc, Blueprint, BlueprintKind, OwnerKind};
use loom_core::{obj, Delta, NamespacedName, ObjectKey, TypeKey, API_VERSION};
use loom_selector::matches;
use serde_json::Value;
use tracing::{trace, warn};

use crate::blueprint::template_refs;
use crate::{Controller, Reconciler, WorkKey, TEMPLATE_KINDS};

/// Owners and runnables named by the standard labels on a stamped object.
fn labelled(doc: &Value) -> Vec<WorkKey> {
    let mut out = Vec::new();
    let ns = obj::namespace(doc);
    for kind in [OwnerKind::Workload, OwnerKind::Deliverable] {
        if let Some(name) = obj::label(doc, &owner_name_key(kind)) {
            let owner_ns = obj::label(doc, &owner_namespace_key(kind)).or(ns);
            out.push(WorkKey::new(Reconciler::for_owner(kind), NamespacedName::new(owner_ns, name)));
        }
    }
    if let Some(name) = obj::label(doc, RUNNABLE_NAME) {
        out.push(WorkKey::new(Reconciler::Runnable, NamespacedName::new(ns, name)));
    }
    out
}

impl Controller {
    /// Work triggered by one store change.
    pub async fn route(&self, delta: &Delta) -> Vec<WorkKey> {
        let key = &delta.key;
        let mut out = Vec::new();
        if let Some(own) = WorkKey::of(key) {
            out.push(own);
        }
        out.extend(labelled(&delta.raw));
        out.extend(self.dependents(key));
        if key.api_version == API_VERSION {
            if let Some(bk) = BlueprintKind::from_kind(&key.kind) {
                out.extend(self.owners_of_blueprint(bk, &delta.raw).await);
            } else if TEMPLATE_KINDS.contains(&key.kind.as_str()) {
                out.extend(self.users_of_template(key).await);
            }
        }
        out.sort();
        out.dedup();
        trace!(object = %key, work = out.len(), "routed");
        out
    }

    async fn list(&self, ty: &TypeKey) -> Vec<Value> {
        match self.store().list(ty, None, &Default::default()).await {
            Ok(v) => v,
            Err(e) => {
                warn!(gvk = %ty, error = %e, "unable to list while routing");
                Vec::new()
            }
        }
    }

    // Owners the blueprint selects now, plus owners that selected it before.
    async fn owners_of_blueprint(&self, bk: BlueprintKind, raw: &Value) -> Vec<WorkKey> {
        let owner_kind = bk.owner_kind();
        let name = obj::name(raw).unwrap_or("");
        let selector = from_doc::<Blueprint>(raw).ok().map(|bp| bp.spec.selector());
        self.list(&TypeKey::loom(owner_kind.as_str()))
            .await
            .iter()
            .filter(|o| {
                let selected = selector.as_ref().map(|s| matches(s, o).unwrap_or(false)).unwrap_or(false);
                let referenced = o["status"]["blueprintRef"]["name"].as_str() == Some(name);
                selected || referenced
            })
            .filter_map(ObjectKey::of)
            .map(|k| WorkKey::new(Reconciler::for_owner(owner_kind), k.named()))
            .collect()
    }

    // Blueprints referencing the template, and the owners those blueprints select.
    async fn users_of_template(&self, template: &ObjectKey) -> Vec<WorkKey> {
        let mut out = Vec::new();
        for bk in [BlueprintKind::SupplyChain, BlueprintKind::Delivery] {
            for doc in self.list(&TypeKey::loom(bk.as_str())).await {
                let Ok(bp) = from_doc::<Blueprint>(&doc) else { continue };
                if !template_refs(&bp).contains(template) {
                    continue;
                }
                out.push(WorkKey::new(Reconciler::for_blueprint(bk), NamespacedName::new(None, bp.name())));
                out.extend(self.owners_of_blueprint(bk, &doc).await);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn standard_labels_name_the_owner() {
        let doc = json!({
            "metadata": {
                "name": "app-repo",
                "namespace": "dev",
                "labels": {
                    "carto.run/workload-name": "app",
                    "carto.run/workload-namespace": "dev",
                    "carto.run/runnable-name": "tests"
                }
            }
        });
        assert_eq!(
            labelled(&doc),
            vec![
                WorkKey::new(Reconciler::Workload, NamespacedName::new(Some("dev"), "app")),
                WorkKey::new(Reconciler::Runnable, NamespacedName::new(Some("dev"), "tests")),
            ]
        );
        assert!(labelled(&json!({"metadata": {"name": "x"}})).is_empty());
    }
}
