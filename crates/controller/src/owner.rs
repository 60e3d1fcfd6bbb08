//! Workload and Deliverable reconciler.

use loom_apply::delete_object;
use loom_core::conditions::{self, Condition, ConditionSet, ConditionType, Reason};
use loom_core::events::OwnerEvent;
use loom_core::labels::TEMPLATE_LIFECYCLE;
use loom_core::model::{from_doc, to_doc, Blueprint, BlueprintKind, BlueprintRef, Owner, OwnerKind, OwnerStatus};
use loom_core::validate::validate_blueprint;
use loom_core::{obj, ObjectKey, TypeKey};
use loom_realizer::{orphaned, RealizeError, Realization, Realizer, Target};
use loom_selector::{select, Selection};
use loom_store::{service_account_key, ObjectStore};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{Controller, ReconcileError, WorkKey};

enum Choice {
    Chosen(Blueprint),
    Refused(Condition),
}

fn describe_labels(doc: &Value) -> String {
    obj::labels(doc).iter().map(|(k, v)| format!("{}:{}", k, v)).collect::<Vec<_>>().join(" ")
}

async fn choose(c: &Controller, owner: &Owner, doc: &Value, bk: BlueprintKind) -> Result<Choice, ReconcileError> {
    let ready = bk.ready_condition();
    let kind = owner.kind.to_lowercase();
    if !owner.has_labels() {
        let msg = format!("{} [{}] is missing required labels", kind, owner.name());
        return Ok(Choice::Refused(Condition::failed(ready, Reason::LabelsMissing, msg)));
    }
    let docs = c.store().list(&TypeKey::loom(bk.as_str()), None, &Default::default()).await?;
    let candidates: Vec<Blueprint> = docs
        .iter()
        .filter_map(|d| match from_doc::<Blueprint>(d) {
            Ok(bp) => Some(bp),
            Err(e) => {
                warn!(error = %e, "skipping unreadable blueprint");
                None
            }
        })
        .collect();
    let refused = |reason: Reason, msg: String| -> Result<Choice, ReconcileError> {
        Ok(Choice::Refused(Condition::failed(ready, reason, msg)))
    };
    match select(doc, &candidates) {
        Err(e) => refused(Reason::UnknownError, e.to_string()),
        Ok(Selection::NotFound) => refused(
            Reason::NotFound,
            format!("no {} found where full selector is satisfied by labels: {}", bk.as_str(), describe_labels(doc)),
        ),
        Ok(Selection::Multiple(found)) => {
            let names: Vec<&str> = found.iter().map(|b| b.name()).collect();
            refused(
                Reason::MultipleMatches,
                format!("more than one {} selected {} [{}]: {}", bk.as_str(), kind, owner.name(), names.join(", ")),
            )
        }
        Ok(Selection::Found(bp)) if !bp.is_ready() => {
            refused(Reason::MissingReady, format!("{} [{}] is not in ready state", bk.as_str(), bp.name()))
        }
        Ok(Selection::Found(bp)) => Ok(Choice::Chosen(bp.clone())),
    }
}

// Owner SA, then the blueprint's, then `default` in the owner namespace.
fn service_account<'a>(owner: &'a Owner, bp: &'a Blueprint) -> (&'a str, &'a str) {
    if let Some(name) = owner.spec.service_account_name.as_deref().filter(|n| !n.is_empty()) {
        return (owner.namespace(), name);
    }
    match &bp.spec.service_account_ref {
        Some(r) if !r.name.is_empty() => {
            (r.namespace.as_deref().filter(|n| !n.is_empty()).unwrap_or(owner.namespace()), r.name.as_str())
        }
        _ => (owner.namespace(), "default"),
    }
}

async fn remove_orphans(scoped: &dyn ObjectStore, owner: &Owner, next: &Realization) -> Vec<OwnerEvent> {
    let mut removed = Vec::new();
    for orphan in orphaned(&owner.status.resources, &next.resources) {
        if orphan.template_in_use {
            // Older immutable objects stay; retention owns them.
            match scoped.get(&orphan.key).await {
                Ok(Some(live)) if obj::label(&live, TEMPLATE_LIFECYCLE) != Some("mutable") => continue,
                Ok(None) => continue,
                _ => {}
            }
        }
        match delete_object(scoped, &orphan.key).await {
            Ok(true) => {
                info!(owner = owner.name(), object = %orphan.key, "deleted orphaned object");
                removed.push(OwnerEvent::removed(&orphan.key));
            }
            Ok(false) => {}
            Err(e) => warn!(owner = owner.name(), object = %orphan.key, error = %e, "unable to delete orphaned object"),
        }
    }
    removed
}

async fn publish(c: &Controller, owner: &Value, events: &[OwnerEvent]) {
    for ev in events {
        if let Err(e) = c.shared.events.record(owner, ev).await {
            warn!(reason = %ev.reason, error = %e, "unable to record event");
        }
    }
}

pub(crate) async fn reconcile(c: &Controller, kind: OwnerKind, work: &WorkKey) -> Result<(), ReconcileError> {
    let key = work.object_key();
    let Some(doc) = c.store().get(&key).await? else {
        debug!(owner = %key, "owner no longer exists");
        c.forget(work);
        return Ok(());
    };
    let owner: Owner = match from_doc(&doc) {
        Ok(o) => o,
        Err(e) => {
            warn!(owner = %key, error = %e, "unreadable owner");
            return Ok(());
        }
    };
    let bk = kind.blueprint_kind();
    let ready = bk.ready_condition();
    let mut set = ConditionSet::new(ConditionType::Ready);
    let mut status = OwnerStatus {
        observed_generation: owner.status.observed_generation,
        conditions: Vec::new(),
        blueprint_ref: owner.status.blueprint_ref.clone(),
        resources: owner.status.resources.clone(),
    };
    let mut tracked: Vec<ObjectKey> = Vec::new();
    let mut retry: Option<ReconcileError> = None;

    match choose(c, &owner, &doc, bk).await? {
        Choice::Refused(cond) => {
            info!(owner = %key, reason = %cond.reason, "no blueprint");
            set.add(cond);
        }
        Choice::Chosen(bp) => {
            status.blueprint_ref = Some(BlueprintRef { kind: bk.as_str().to_string(), name: bp.name().to_string() });
            tracked.push(ObjectKey::loom(bk.as_str(), None, bp.name()));
            match validate_blueprint(&bp) {
                Err(e) => set.add(Condition::failed(ready, Reason::BlueprintInvalid, e.message())),
                Ok(graph) => {
                    set.add(Condition::ok(ready, Reason::Ready));
                    let (sa_ns, sa_name) = service_account(&owner, &bp);
                    tracked.push(service_account_key(sa_ns, sa_name));
                    let realization = match c.shared.accounts.for_service_account(sa_ns, sa_name).await {
                        Ok(scoped) => {
                            let realizer = Realizer { templates: &**c.store(), store: &*scoped, ytt: &*c.shared.ytt };
                            let target = Target { kind, owner: &owner, doc: &doc, blueprint: &bp, graph: &graph };
                            let mut r = realizer.realize(&target).await;
                            let removed = remove_orphans(&*scoped, &owner, &r).await;
                            r.events.extend(removed);
                            r
                        }
                        Err(source) => {
                            warn!(owner = %key, account = sa_name, error = %source, "service account unavailable");
                            let e = RealizeError::ServiceAccount {
                                namespace: sa_ns.to_string(),
                                name: sa_name.to_string(),
                                source,
                            };
                            Realization::aborted(&owner.status.resources, e)
                        }
                    };
                    publish(c, &doc, &realization.events).await;
                    set.add(realization.submitted());
                    set.add(realization.healthy());
                    tracked.extend(realization.tracked.iter().cloned());
                    let stamped_types = realization
                        .resources
                        .iter()
                        .filter_map(|r| r.stamped_ref.as_ref())
                        .map(|r| TypeKey::new(&r.api_version, &r.kind));
                    c.ensure_watched(stamped_types.collect::<Vec<_>>()).await;
                    status.resources = realization.resources;
                    retry = realization.error.filter(|e| e.is_retryable()).map(ReconcileError::from);
                }
            }
        }
    }
    c.track(work, tracked);

    let (conds, changed) = set.finalize(&owner.status.conditions, conditions::now());
    status.conditions = conds;
    if retry.is_none() {
        status.observed_generation = Some(owner.generation());
    }
    if changed || status != owner.status {
        let mut next = doc;
        next["status"] = to_doc(&status)?;
        c.store().update_status(next).await?;
        debug!(owner = %key, "status updated");
    }
    match retry {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner(sa: Option<&str>) -> Owner {
        from_doc(&json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "Workload",
            "metadata": {"name": "app", "namespace": "dev"},
            "spec": {"serviceAccountName": sa}
        }))
        .unwrap()
    }

    fn blueprint(sa: Value) -> Blueprint {
        from_doc(&json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "ClusterSupplyChain",
            "metadata": {"name": "sc"},
            "spec": {"selector": {"a": "b"}, "resources": [], "serviceAccountRef": sa}
        }))
        .unwrap()
    }

    #[test]
    fn service_account_precedence() {
        let bp = blueprint(json!({"name": "deployer", "namespace": "ops"}));
        assert_eq!(service_account(&owner(Some("builder")), &bp), ("dev", "builder"));
        assert_eq!(service_account(&owner(None), &bp), ("ops", "deployer"));
        let bp = blueprint(json!({"name": "deployer"}));
        assert_eq!(service_account(&owner(None), &bp), ("dev", "deployer"));
        let bp = blueprint(Value::Null);
        assert_eq!(service_account(&owner(Some("")), &bp), ("dev", "default"));
    }
}
