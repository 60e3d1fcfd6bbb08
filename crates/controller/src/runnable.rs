use loom_core::conditions;
use loom_core::model::{from_doc, to_doc, Runnable, RunnableStatus};
use loom_core::validate::validate_runnable;
use loom_runnable::{RunOutcome, RunnableEngine, RunnableError};
use loom_store::service_account_key;
use tracing::{debug, warn};

use crate::{Controller, ReconcileError, WorkKey};

pub(crate) async fn reconcile(c: &Controller, work: &WorkKey) -> Result<(), ReconcileError> {
    let key = work.object_key();
    let Some(doc) = c.store().get(&key).await? else {
        debug!(runnable = %key, "runnable no longer exists");
        c.forget(work);
        return Ok(());
    };
    let runnable: Runnable = match from_doc(&doc).and_then(|r: Runnable| validate_runnable(&r).map(|_| r)) {
        Ok(r) => r,
        Err(e) => {
            warn!(runnable = %key, error = %e, "invalid runnable");
            return Ok(());
        }
    };
    let (ns, sa) = (runnable.namespace(), runnable.service_account());
    let outcome = match c.shared.accounts.for_service_account(ns, sa).await {
        Ok(scoped) => RunnableEngine { templates: &**c.store(), store: &*scoped }.run(&runnable, &doc).await,
        Err(source) => {
            warn!(runnable = %key, account = sa, error = %source, "service account unavailable");
            RunOutcome {
                outputs: runnable.status.outputs.clone(),
                error: Some(RunnableError::service_account(ns, sa, source)),
                ..Default::default()
            }
        }
    };
    let mut tracked = outcome.tracked.clone();
    tracked.push(service_account_key(ns, sa));
    c.track(work, tracked);
    c.ensure_watched(outcome.watched.clone()).await;

    let (conds, changed) = outcome.conditions(&runnable.status.conditions, conditions::now());
    let retry = outcome.error.as_ref().filter(|e| e.is_retryable()).cloned();
    let state = outcome.state();
    let status = RunnableStatus {
        observed_generation: match retry {
            Some(_) => runnable.status.observed_generation,
            None => Some(runnable.generation()),
        },
        conditions: conds,
        outputs: outcome.outputs,
    };
    if changed || status != runnable.status {
        let mut next = doc;
        next["status"] = to_doc(&status)?;
        c.store().update_status(next).await?;
        debug!(runnable = %key, state = ?state, "status updated");
    }
    match retry {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
