//! Supply chain and delivery reconciler: validates the graph and checks every referenced
//! template exists.

use loom_core::conditions::{self, Condition, ConditionSet, ConditionType, Reason};
use loom_core::model::{from_doc, to_doc, Blueprint, BlueprintKind, BlueprintStatus};
use loom_core::validate::validate_blueprint;
use loom_core::ObjectKey;
use tracing::{debug, info, warn};

use crate::{Controller, ReconcileError, WorkKey};

/// `(kind, name)` of every template a blueprint can reach, options included.
pub(crate) fn template_refs(bp: &Blueprint) -> Vec<ObjectKey> {
    let mut out = Vec::new();
    for res in &bp.spec.resources {
        let kind = res.template_ref.kind.as_str();
        if let Some(name) = &res.template_ref.name {
            out.push(ObjectKey::loom(kind, None, name));
        }
        out.extend(res.template_ref.options.iter().filter_map(|o| o.name.as_deref()).map(|n| ObjectKey::loom(kind, None, n)));
    }
    out
}

pub(crate) async fn reconcile(c: &Controller, kind: BlueprintKind, work: &WorkKey) -> Result<(), ReconcileError> {
    let key = work.object_key();
    let Some(doc) = c.store().get(&key).await? else {
        debug!(blueprint = %key, "blueprint no longer exists");
        c.forget(work);
        return Ok(());
    };
    let bp: Blueprint = match from_doc(&doc) {
        Ok(b) => b,
        Err(e) => {
            warn!(blueprint = %key, error = %e, "unreadable blueprint");
            return Ok(());
        }
    };
    let mut set = ConditionSet::new(ConditionType::Ready);
    let refs = template_refs(&bp);
    match validate_blueprint(&bp) {
        Err(e) => {
            info!(blueprint = %key, kind = kind.as_str(), error = %e, "invalid blueprint");
            set.add(Condition::failed(ConditionType::TemplatesReady, Reason::BlueprintInvalid, e.message()));
        }
        Ok(_) => {
            let mut missing = Vec::new();
            for r in &refs {
                if c.store().get(r).await?.is_none() {
                    missing.push(format!("{}/{}", r.kind, r.name));
                }
            }
            set.add(if missing.is_empty() {
                Condition::ok(ConditionType::TemplatesReady, Reason::Ready)
            } else {
                Condition::failed(
                    ConditionType::TemplatesReady,
                    Reason::TemplatesNotFound,
                    format!("did not find templates: {}", missing.join(", ")),
                )
            });
        }
    }
    c.track(work, refs);

    let (conds, changed) = set.finalize(&bp.status.conditions, conditions::now());
    let status = BlueprintStatus { observed_generation: Some(bp.generation()), conditions: conds };
    if changed || status != bp.status {
        let mut next = doc;
        next["status"] = to_doc(&status)?;
        c.store().update_status(next).await?;
        debug!(blueprint = %key, "status updated");
    }
    Ok(())
}
