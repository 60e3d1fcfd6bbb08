use chrono::{DateTime, Utc};
use loom_core::conditions::{Condition, ConditionSet, ConditionStatus, ConditionType, Reason};
use loom_core::events::OwnerEvent;
use loom_core::model::{InputStatus, OutputStatus, ResourceStatus, StampedRef, TemplateRefStatus};
use loom_core::{obj, ObjectKey};
use loom_templates::{evaluate_health, output_statuses, Output, Realized, ResolvedTemplate};
use serde_json::Value;
use tracing::warn;

use crate::RealizeError;

/// What realizing one resource produced, filled in step by step.
#[derive(Debug, Default)]
pub(crate) struct Node {
    pub pass_through: bool,
    pub inputs: Vec<InputStatus>,
    pub template_ref: Option<TemplateRefStatus>,
    pub template: Option<ResolvedTemplate>,
    pub stamped: Option<Value>,
    /// Set when this pass wrote the stamped object; `true` for a create.
    pub applied: Option<bool>,
    pub output: Option<Output>,
}

impl Node {
    fn health(&self) -> Condition {
        if self.pass_through {
            let realized = Realized { has_outputs: self.output.is_some(), ..Default::default() };
            return evaluate_health(None, Some(&realized));
        }
        let Some(tpl) = &self.template else {
            return evaluate_health(None, None);
        };
        let realized = Realized {
            template_kind: tpl.template_kind(),
            has_stamped_ref: self.stamped.is_some(),
            has_outputs: self.output.is_some(),
            stamped: self.stamped.as_ref(),
        };
        evaluate_health(tpl.health.as_ref(), Some(&realized))
    }
}

pub fn stamped_ref(doc: &Value) -> Option<StampedRef> {
    Some(StampedRef {
        api_version: obj::api_version(doc)?.to_string(),
        kind: obj::kind(doc)?.to_string(),
        namespace: obj::namespace(doc).map(str::to_string),
        name: obj::name(doc)?.to_string(),
    })
}

fn ref_key(r: &StampedRef) -> ObjectKey {
    ObjectKey::new(&r.api_version, &r.kind, r.namespace.as_deref(), &r.name)
}

pub(crate) fn record(
    name: &str,
    node: &Node,
    error: Option<&RealizeError>,
    prev: Option<&ResourceStatus>,
    now: DateTime<Utc>,
) -> ResourceStatus {
    let mut stamped = node.stamped.as_ref().and_then(stamped_ref);
    let mut template_ref = node.template_ref.clone();
    let carried = (!node.pass_through && stamped.is_none() && template_ref.is_none()).then_some(prev).flatten();
    let healthy = match carried {
        Some(p) => {
            stamped = p.stamped_ref.clone();
            template_ref = p.template_ref.clone();
            p.condition(ConditionType::Healthy.as_str()).cloned().unwrap_or_else(|| node.health())
        }
        None => node.health(),
    };
    let outputs = match &node.output {
        Some(out) => output_statuses(out, prev.map(|p| p.outputs.as_slice()).unwrap_or(&[]), now).unwrap_or_else(|e| {
            warn!(resource = name, error = %e, "unable to render outputs");
            Vec::new()
        }),
        None => Vec::new(),
    };
    let submitted = match error {
        Some(e) => e.condition(ConditionType::ResourceSubmitted),
        None => Condition::ok(ConditionType::ResourceSubmitted, Reason::Ready),
    };
    let mut set = ConditionSet::new(ConditionType::Ready);
    set.add(submitted);
    set.add(healthy);
    let (conditions, _) = set.finalize(prev.map(|p| p.conditions.as_slice()).unwrap_or(&[]), now);
    ResourceStatus {
        name: name.to_string(),
        stamped_ref: stamped,
        template_ref,
        inputs: node.inputs.clone(),
        outputs,
        conditions,
    }
}

fn digests(outputs: &[OutputStatus]) -> Vec<(&str, &str)> {
    outputs.iter().map(|o| (o.name.as_str(), o.digest.as_str())).collect()
}

fn healthy(rs: &ResourceStatus) -> Option<ConditionStatus> {
    rs.condition(ConditionType::Healthy.as_str()).map(|c| c.status)
}

/// Events for the owner describing what changed between `prev` and `next`.
pub(crate) fn events(node: &Node, prev: Option<&ResourceStatus>, next: &ResourceStatus) -> Vec<OwnerEvent> {
    let mut out = Vec::new();
    let object = next.stamped_ref.as_ref().map(ref_key);
    if let (Some(created), Some(o)) = (node.applied, &object) {
        out.push(OwnerEvent::applied(o, created));
    }
    let before = prev.map(|p| p.outputs.as_slice()).unwrap_or(&[]);
    if !next.outputs.is_empty() && digests(&next.outputs) != digests(before) {
        let from = if node.pass_through { None } else { object.as_ref() };
        out.push(OwnerEvent::output_changed(&next.name, from));
    }
    let now = healthy(next);
    if let Some(status) = now.filter(|s| Some(*s) != prev.and_then(healthy)) {
        out.push(OwnerEvent::health_changed(&next.name, object.as_ref(), status.as_str()));
    }
    out
}

/// A stamped object the new statuses no longer reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
    pub key: ObjectKey,
    /// The resource still exists with the same template; immutable history must survive.
    pub template_in_use: bool,
}

/// Stamped objects referenced by `prev` but by nothing in `next`.
pub fn orphaned(prev: &[ResourceStatus], next: &[ResourceStatus]) -> Vec<Orphan> {
    prev.iter()
        .filter_map(|p| {
            let r = p.stamped_ref.as_ref()?;
            if next.iter().any(|n| n.stamped_ref.as_ref() == Some(r)) {
                return None;
            }
            let template_in_use = next.iter().any(|n| n.name == p.name && n.template_ref.is_some() && n.template_ref == p.template_ref);
            Some(Orphan { key: ref_key(r), template_in_use })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use loom_core::conditions::ConditionStatus;
    use loom_core::model::OutputStatus;
    use loom_store::StoreError;
    use serde_json::json;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn status(name: &str, object: &str, template: &str) -> ResourceStatus {
        ResourceStatus {
            name: name.into(),
            stamped_ref: Some(StampedRef { api_version: "v1".into(), kind: "ConfigMap".into(), namespace: Some("dev".into()), name: object.into() }),
            template_ref: Some(TemplateRefStatus { kind: "ClusterTemplate".into(), name: template.into() }),
            ..Default::default()
        }
    }

    #[test]
    fn failed_node_carries_previous_refs_and_health() {
        let mut prev = status("cm", "cm", "plain");
        prev.conditions = vec![Condition {
            last_transition_time: Some(t(0)),
            ..Condition::ok(ConditionType::Healthy, Reason::AlwaysHealthy)
        }];
        let err = RealizeError::Read { what: "x".into(), source: StoreError::Transport("down".into()) };
        let rs = record("cm", &Node::default(), Some(&err), Some(&prev), t(10));
        assert_eq!(rs.stamped_ref, prev.stamped_ref);
        assert_eq!(rs.template_ref, prev.template_ref);
        let healthy = rs.condition("Healthy").unwrap();
        assert!(healthy.is_true());
        assert_eq!(healthy.last_transition_time, Some(t(0)));
        let submitted = rs.condition("ResourceSubmitted").unwrap();
        assert_eq!(submitted.reason, "TemplateObjectRetrievalFailure");
        assert_eq!(rs.condition("Ready").unwrap().status, ConditionStatus::False);
    }

    #[test]
    fn pass_through_reports_output_available() {
        let node = Node {
            pass_through: true,
            output: Some(Output::Source { url: json!("u"), revision: json!("r") }),
            ..Default::default()
        };
        let rs = record("pt", &node, None, None, t(0));
        assert!(rs.stamped_ref.is_none());
        assert_eq!(rs.outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(), vec!["url", "revision"]);
        assert_eq!(rs.condition("Healthy").unwrap().reason, "OutputAvailable");
        assert!(rs.condition("Ready").unwrap().is_true());
    }

    #[test]
    fn unchanged_output_keeps_transition_time() {
        let node = Node { pass_through: true, output: Some(Output::Image(json!("img:1"))), ..Default::default() };
        let first = record("img", &node, None, None, t(0));
        let again = record("img", &node, None, Some(&first), t(30));
        assert_eq!(again.outputs, first.outputs);
        let moved = Node { output: Some(Output::Image(json!("img:2"))), ..node };
        let next = record("img", &moved, None, Some(&again), t(60));
        let o: &OutputStatus = &next.outputs[0];
        assert_eq!(o.last_transition_time, Some(t(60)));
        assert!(o.preview.starts_with("img:2"));
    }

    #[test]
    fn events_follow_writes_outputs_and_health() {
        let node = Node {
            stamped: Some(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm", "namespace": "dev"}})),
            applied: Some(true),
            output: Some(Output::Config(json!({"a": 1}))),
            ..Default::default()
        };
        let first = record("cfg", &node, None, None, t(0));
        let reasons = |evs: Vec<OwnerEvent>| evs.into_iter().map(|e| e.reason.as_str()).collect::<Vec<_>>();
        assert_eq!(
            reasons(events(&node, None, &first)),
            vec!["StampedObjectApplied", "ResourceOutputChanged", "ResourceHealthyStatusChanged"]
        );

        let quiet = Node { applied: None, ..node };
        let again = record("cfg", &quiet, None, Some(&first), t(10));
        assert!(events(&quiet, Some(&first), &again).is_empty());

        let moved = Node { output: Some(Output::Config(json!({"a": 2}))), ..quiet };
        let next = record("cfg", &moved, None, Some(&again), t(20));
        let evs = events(&moved, Some(&again), &next);
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].note, "[cfg] found a new output in [configmap/cm]");
    }

    #[test]
    fn orphans_exclude_live_references() {
        let prev = vec![status("a", "cm-a", "plain"), status("b", "cm-b", "plain"), status("c", "run-1", "tekton")];
        let next = vec![status("a", "cm-a", "plain"), status("c", "run-2", "tekton")];
        let orphans = orphaned(&prev, &next);
        assert_eq!(orphans.len(), 2);
        assert_eq!(orphans[0], Orphan { key: ObjectKey::new("v1", "ConfigMap", Some("dev"), "cm-b"), template_in_use: false });
        assert!(orphans[1].template_in_use);
    }
}
