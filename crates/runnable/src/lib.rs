//! Loom runnable engine: stamps one immutable run per distinct input set, reuses runs with a
//! matching fingerprint, keeps bounded run history and surfaces the newest successful
//! run's outputs on the runnable.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use loom_apply::{enforce_retention, ensure_immutable, newest};
use loom_core::conditions::{Condition, ConditionSet, ConditionStatus, ConditionType, Reason};
use loom_core::labels::run_labels;
use loom_core::model::{from_doc, RunTemplate, Runnable, RunnableSelector};
use loom_core::{obj, ObjectKey, TypeKey};
use loom_store::ObjectStore;
use loom_templates::{named_outputs, runnable_context, OutputSpec, ResolvedTemplate, Stamper, TemplateBody};
use serde_json::Value;
use tracing::{debug, info, warn};

mod error;

pub use error::{RunnableError, SelectorMiss};

/// Where the newest run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn of(run: Option<&Value>) -> Self {
        let Some(run) = run else { return RunState::Pending };
        match obj::condition(run, ConditionType::Succeeded.as_str()).map(|c| c.status) {
            Some(ConditionStatus::True) => RunState::Succeeded,
            Some(ConditionStatus::False) => RunState::Failed,
            _ => RunState::Running,
        }
    }
}

fn succeeded(run: &Value) -> ConditionStatus {
    obj::condition(run, ConditionType::Succeeded.as_str()).map(|c| c.status).unwrap_or_default()
}

/// Result of one pass over a runnable.
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// The run matching the current inputs, created or reused.
    pub stamped: Option<Value>,
    pub outputs: BTreeMap<String, Value>,
    /// Objects read while stamping; changes to them should requeue the runnable.
    pub tracked: Vec<ObjectKey>,
    /// Types whose changes should requeue the runnable.
    pub watched: Vec<TypeKey>,
    pub deleted: usize,
    pub error: Option<RunnableError>,
}

impl RunOutcome {
    fn failed(error: RunnableError, previous: &BTreeMap<String, Value>) -> Self {
        Self { outputs: previous.clone(), error: Some(error), ..Default::default() }
    }

    pub fn state(&self) -> RunState {
        RunState::of(self.stamped.as_ref())
    }

    /// `Ready`, `RunTemplateReady` and `StampedObjectCondition`, merged with `prev`.
    pub fn conditions(&self, prev: &[Condition], now: DateTime<Utc>) -> (Vec<Condition>, bool) {
        let mut set = ConditionSet::new(ConditionType::Ready);
        set.add(match &self.error {
            Some(e) => e.condition(),
            None => Condition::ok(ConditionType::RunTemplateReady, Reason::Ready),
        });
        let mirrored = self.stamped.as_ref().and_then(|s| obj::condition(s, ConditionType::Succeeded.as_str()));
        set.add(match mirrored {
            Some(c) => Condition::new(ConditionType::StampedObjectCondition, c.status, Reason::SucceededCondition, c.message),
            None => Condition::unknown(ConditionType::StampedObjectCondition, Reason::Unknown, ""),
        });
        set.finalize(prev, now)
    }
}

fn describe_labels(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Runs runnables. The run template is read through `templates`; runs and the selected
/// object go through `store`, a handle scoped to the runnable's service account.
pub struct RunnableEngine<'a> {
    pub templates: &'a dyn ObjectStore,
    pub store: &'a dyn ObjectStore,
}

impl RunnableEngine<'_> {
    pub async fn run(&self, runnable: &Runnable, doc: &Value) -> RunOutcome {
        let previous = &runnable.status.outputs;
        let mut tracked = Vec::new();
        let mut watched = Vec::new();
        let result = self.stamp_and_collect(runnable, doc, &mut tracked, &mut watched).await;
        let mut out = match result {
            Ok(out) => out,
            Err((stamped, e)) => {
                warn!(runnable = runnable.name(), namespace = runnable.namespace(), reason = %e.reason(), error = %e, "run failed");
                RunOutcome { stamped, ..RunOutcome::failed(e, previous) }
            }
        };
        out.tracked = tracked;
        out.watched = watched;
        out
    }

    async fn resolve_selector(&self, sel: &RunnableSelector, namespace: &str) -> Result<Value, RunnableError> {
        let ty = TypeKey::new(&sel.resource.api_version, &sel.resource.kind);
        let fail = |miss| RunnableError::Selector {
            labels: describe_labels(&sel.matching_labels),
            api_version: sel.resource.api_version.clone(),
            kind: sel.resource.kind.clone(),
            miss,
        };
        let mut found = self
            .store
            .list(&ty, Some(namespace), &sel.matching_labels)
            .await
            .map_err(|e| fail(SelectorMiss::Store(e)))?;
        match found.len() {
            0 => Err(fail(SelectorMiss::NoMatch)),
            1 => Ok(found.remove(0)),
            n => Err(fail(SelectorMiss::Multiple(n))),
        }
    }

    async fn stamp_and_collect(
        &self,
        runnable: &Runnable,
        doc: &Value,
        tracked: &mut Vec<ObjectKey>,
        watched: &mut Vec<TypeKey>,
    ) -> Result<RunOutcome, (Option<Value>, RunnableError)> {
        let tref = &runnable.spec.run_template_ref;
        let name = tref.name.as_str();
        let key = ObjectKey::loom(tref.kind(), None, name);
        tracked.push(key.clone());
        let tdoc = self
            .templates
            .get(&key)
            .await
            .map_err(|source| (None, RunnableError::RunTemplateRead { name: name.to_string(), source }))?
            .ok_or_else(|| (None, RunnableError::RunTemplateNotFound { name: name.to_string() }))?;
        let invalid = |source| (None, RunnableError::RunTemplateInvalid { name: name.to_string(), source });
        let rt: RunTemplate = from_doc(&tdoc).map_err(invalid)?;
        let tpl = ResolvedTemplate::from_run_template(&rt).map_err(invalid)?;

        let selected = match &runnable.spec.selector {
            Some(sel) => {
                watched.push(TypeKey::new(&sel.resource.api_version, &sel.resource.kind));
                let s = self.resolve_selector(sel, runnable.namespace()).await.map_err(|e| (None, e))?;
                if let Some(k) = ObjectKey::of(&s) {
                    tracked.push(k);
                }
                Some(s)
            }
            None => None,
        };

        let labels = run_labels(runnable.name(), name);
        let stamper = Stamper::new(doc, labels.clone(), tpl.lifecycle, runnable.name());
        let ctx = runnable_context(doc, selected.as_ref());
        let raw = match &tpl.body {
            TemplateBody::Raw(raw) => raw,
            TemplateBody::Ytt(_) => {
                let source = loom_core::LoomError::validation("run templates take a raw template body");
                return Err(invalid(source));
            }
        };
        let stamped = stamper
            .stamp_raw(raw, &ctx)
            .map_err(|source| (None, RunnableError::Stamp { runnable: runnable.name().to_string(), source }))?;
        if let Some(ty) = ObjectKey::of(&stamped).map(|k| k.type_key()) {
            watched.push(ty);
        }

        let applied = ensure_immutable(self.store, stamped, &labels)
            .await
            .map_err(|source| (None, RunnableError::Apply { source }))?;
        let current = applied.object.clone();
        if applied.written {
            info!(runnable = runnable.name(), run = obj::name(&current).unwrap_or(""), "run created");
        } else {
            debug!(runnable = runnable.name(), run = obj::name(&current).unwrap_or(""), "run reused");
        }

        let deleted = match enforce_retention(self.store, &applied.history, &runnable.spec.retention_policy, succeeded).await {
            Ok(n) => n,
            Err(e) => {
                warn!(runnable = runnable.name(), error = %e, "unable to clean up old runs");
                0
            }
        };

        let paths = match &tpl.outputs {
            OutputSpec::Named(paths) => paths.clone(),
            _ => BTreeMap::new(),
        };
        let outputs = match newest(&applied.history, |o| succeeded(o) == ConditionStatus::True) {
            Some(run) => named_outputs(&paths, run).map_err(|source| {
                let object = ObjectKey::of(run).map(|k| k.to_string()).unwrap_or_default();
                (Some(current.clone()), RunnableError::Output { object, runnable: runnable.name().to_string(), source })
            })?,
            None => BTreeMap::new(),
        };
        let outputs = if outputs.is_empty() { runnable.status.outputs.clone() } else { outputs };
        Ok(RunOutcome { stamped: Some(current), outputs, deleted, ..Default::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(status: Option<&str>) -> Value {
        match status {
            Some(s) => json!({"status": {"conditions": [{"type": "Succeeded", "status": s, "message": "m"}]}}),
            None => json!({"status": {}}),
        }
    }

    #[test]
    fn state_follows_succeeded_condition() {
        assert_eq!(RunState::of(None), RunState::Pending);
        assert_eq!(RunState::of(Some(&run(None))), RunState::Running);
        assert_eq!(RunState::of(Some(&run(Some("Unknown")))), RunState::Running);
        assert_eq!(RunState::of(Some(&run(Some("True")))), RunState::Succeeded);
        assert_eq!(RunState::of(Some(&run(Some("False")))), RunState::Failed);
    }

    #[test]
    fn conditions_mirror_the_stamped_run() {
        let now = loom_core::conditions::now();
        let out = RunOutcome { stamped: Some(run(Some("False"))), ..Default::default() };
        let (conds, changed) = out.conditions(&[], now);
        assert!(changed);
        assert_eq!(conds[0].type_, "Ready");
        assert!(conds[0].is_false());
        let mirrored = conds.iter().find(|c| c.type_ == "StampedObjectCondition").unwrap();
        assert_eq!((mirrored.reason.as_str(), mirrored.message.as_str()), ("SucceededCondition", "m"));

        let pending = RunOutcome::default();
        let (conds, _) = pending.conditions(&[], now);
        let mirrored = conds.iter().find(|c| c.type_ == "StampedObjectCondition").unwrap();
        assert_eq!((mirrored.status, mirrored.reason.as_str()), (ConditionStatus::Unknown, "Unknown"));
        assert_eq!(conds[0].status, ConditionStatus::Unknown);

        let (again, changed) = pending.conditions(&conds, now + chrono::Duration::seconds(5));
        assert!(!changed);
        assert_eq!(again, conds);
    }
}
