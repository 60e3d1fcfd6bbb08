//! Loom realizer: walks a blueprint graph for one owner in declaration order, stamping and
//! applying one object per resource and feeding each resource's output to its dependents.

#![forbid(unsafe_code)]

use loom_apply::{ensure_immutable, ensure_mutable, enforce_retention, newest};
use loom_core::conditions::{self, reduce, Condition, ConditionStatus, ConditionType};
use loom_core::events::OwnerEvent;
use loom_core::labels::{resource_selector, StampIdentity};
use loom_core::model::{
    Blueprint, BlueprintGraph, BlueprintResource, InputKind, InputStatus, Owner, OwnerKind, ResourceStatus,
    TemplateKind, TemplateRefStatus,
};
use loom_core::{LoomError, ObjectKey};
use loom_selector::{choose_option, OptionChoice};
use loom_store::ObjectStore;
use loom_templates::{
    evaluate_health, extract_output, observe, owner_health, resolve_params, Output, OutputSpec, Preprocessor,
    Realized, ResolvedTemplate, StampContext, Stamper,
};
use serde_json::Value;
use tracing::{debug, info, warn};

mod error;
mod status;

pub use error::RealizeError;
pub use status::{orphaned, stamped_ref, Orphan};

use status::{events, record, Node};

/// One owner matched to one blueprint.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub kind: OwnerKind,
    pub owner: &'a Owner,
    /// The owner as stored; templates see this document.
    pub doc: &'a Value,
    pub blueprint: &'a Blueprint,
    pub graph: &'a BlueprintGraph,
}

#[derive(Debug, Default)]
pub struct Realization {
    pub resources: Vec<ResourceStatus>,
    /// Templates read while realizing; changes to them should requeue the owner.
    pub tracked: Vec<ObjectKey>,
    /// First failure, in declaration order.
    pub error: Option<RealizeError>,
    /// Applies, output changes and health changes to record on the owner.
    pub events: Vec<OwnerEvent>,
    aborted: bool,
}

impl Realization {
    /// Nothing could be attempted; previous resource statuses are kept as they were.
    pub fn aborted(previous: &[ResourceStatus], error: RealizeError) -> Self {
        Self { resources: previous.to_vec(), error: Some(error), aborted: true, ..Default::default() }
    }

    /// Owner `ResourcesSubmitted`.
    pub fn submitted(&self) -> Condition {
        match (&self.error, self.aborted) {
            (Some(e), true) => e.condition(ConditionType::ResourcesSubmitted),
            _ => {
                let subs: Vec<Condition> = self
                    .resources
                    .iter()
                    .filter_map(|r| r.condition(ConditionType::ResourceSubmitted.as_str()).cloned())
                    .collect();
                reduce(ConditionType::ResourcesSubmitted, &subs)
            }
        }
    }

    /// Owner `ResourcesHealthy`.
    pub fn healthy(&self) -> Condition {
        owner_health(&self.resources)
    }
}

/// Realizes blueprints. Templates are read through `templates`; stamped objects are written
/// through `store`, a handle scoped to the owner's service account.
pub struct Realizer<'a> {
    pub templates: &'a dyn ObjectStore,
    pub store: &'a dyn ObjectStore,
    pub ytt: &'a dyn Preprocessor,
}

// Health of one immutable object, used to pick outputs and to apply retention.
fn outcome(tpl: &ResolvedTemplate, kind: TemplateKind, o: &Value, deployment: Option<&Output>) -> ConditionStatus {
    let observed = match &tpl.outputs {
        OutputSpec::Deployment(obs) => observe(obs, o).is_ok(),
        _ => true,
    };
    let has_outputs = observed && matches!(extract_output(tpl, o, deployment), Ok(Some(_)));
    let realized = Realized { template_kind: Some(kind), has_stamped_ref: true, has_outputs, stamped: Some(o) };
    evaluate_health(tpl.health.as_ref(), Some(&realized)).status
}

impl Realizer<'_> {
    pub async fn realize(&self, t: &Target<'_>) -> Realization {
        let now = conditions::now();
        let mut outputs: Vec<Option<Output>> = vec![None; t.graph.len()];
        let mut out = Realization::default();
        for (idx, res) in t.blueprint.spec.resources.iter().enumerate() {
            let mut node = Node::default();
            let result = self.realize_node(t, idx, res, &outputs, &mut node, &mut out.tracked).await;
            match &result {
                Ok(()) => debug!(owner = t.owner.name(), resource = %res.name, "resource realized"),
                Err(e) => warn!(
                    owner = t.owner.name(),
                    resource = %res.name,
                    reason = %e.reason(),
                    error = %e,
                    "resource not realized"
                ),
            }
            let prev = t.owner.resource_status(&res.name);
            let status = record(&res.name, &node, result.as_ref().err(), prev, now);
            out.events.extend(events(&node, prev, &status));
            out.resources.push(status);
            match result {
                Ok(()) => {
                    if let Some(slot) = outputs.get_mut(idx) {
                        *slot = node.output;
                    }
                }
                Err(e) => {
                    out.error.get_or_insert(e);
                }
            }
        }
        if out.error.is_none() {
            info!(owner = t.owner.name(), blueprint = t.blueprint.name(), resources = out.resources.len(), "realized");
        }
        out
    }

    async fn realize_node(
        &self,
        t: &Target<'_>,
        idx: usize,
        res: &BlueprintResource,
        outputs: &[Option<Output>],
        node: &mut Node,
        tracked: &mut Vec<ObjectKey>,
    ) -> Result<(), RealizeError> {
        let resource = res.name.as_str();
        let choice = match &res.template_ref.name {
            Some(name) => OptionChoice::Template(name),
            None => choose_option(&res.template_ref.options, t.doc)
                .map_err(|source| RealizeError::Options { resource: resource.to_string(), source })?,
        };

        let mut ctx = StampContext::new(t.kind, t.doc.clone());
        for edge in t.graph.inputs(idx) {
            let producer = t.graph.name(edge.producer);
            node.inputs.push(InputStatus { name: producer.to_string() });
            let Some(output) = outputs.get(edge.producer).cloned().flatten() else {
                return Err(RealizeError::MissingInput { resource: resource.to_string(), producer: producer.to_string() });
            };
            match edge.kind {
                InputKind::Deployment => ctx.set_deployment(output),
                _ => ctx.add_input(&edge.name, output),
            }
        }

        let name = match choice {
            OptionChoice::PassThrough(input) => {
                node.pass_through = true;
                let forwarded = ctx.input(input).cloned().ok_or_else(|| RealizeError::MissingInput {
                    resource: resource.to_string(),
                    producer: input.to_string(),
                })?;
                node.output = Some(forwarded);
                return Ok(());
            }
            OptionChoice::Template(name) => name,
        };

        let kind = res.template_ref.kind.as_str();
        let key = ObjectKey::loom(kind, None, name);
        tracked.push(key.clone());
        let doc = self
            .templates
            .get(&key)
            .await
            .map_err(|source| RealizeError::Read { what: key.to_string(), source })?
            .ok_or_else(|| RealizeError::TemplateNotFound {
                resource: resource.to_string(),
                kind: kind.to_string(),
                name: name.to_string(),
            })?;
        let invalid = |source: LoomError| RealizeError::TemplateInvalid {
            resource: resource.to_string(),
            name: name.to_string(),
            source,
        };
        let tpl = ResolvedTemplate::from_doc(&doc).map_err(invalid)?;
        let template_kind = tpl
            .template_kind()
            .ok_or_else(|| invalid(LoomError::validation("run templates cannot back blueprint resources")))?;
        node.template_ref = Some(TemplateRefStatus { kind: kind.to_string(), name: name.to_string() });
        node.template = Some(tpl.clone());

        let params = resolve_params(&tpl.defaults, &res.params, &t.blueprint.spec.params, &t.owner.spec.params);
        let ctx = ctx.with_params(params);
        let identity = StampIdentity {
            owner_kind: t.kind,
            owner_name: t.owner.name(),
            owner_namespace: t.owner.namespace(),
            blueprint: t.blueprint.name(),
            resource,
            template_kind,
            template_name: name,
            lifecycle: tpl.lifecycle.as_str(),
        };
        let stamper = Stamper::new(t.doc, identity.labels(), tpl.lifecycle, format!("{}-{}", t.owner.name(), resource));
        let stamped = stamper
            .stamp(&tpl.body, &ctx.to_value(), self.ytt)
            .await
            .map_err(|source| RealizeError::Stamp { resource: resource.to_string(), source })?;

        let apply_err = |source| RealizeError::Apply { resource: resource.to_string(), source };
        let current = if tpl.lifecycle.is_immutable() {
            let selector = resource_selector(t.kind, t.owner.name(), t.owner.namespace(), resource);
            let applied = ensure_immutable(self.store, stamped, &selector).await.map_err(apply_err)?;
            node.stamped = Some(applied.object.clone());
            node.applied = applied.written.then_some(applied.created);
            let judge = |o: &Value| outcome(&tpl, template_kind, o, ctx.deployment());
            if let Some(policy) = &tpl.retention {
                enforce_retention(self.store, &applied.history, policy, judge).await.map_err(apply_err)?;
            }
            newest(&applied.history, |o| judge(o) == ConditionStatus::True)
                .cloned()
                .ok_or_else(|| RealizeError::NoHealthyObject { resource: resource.to_string() })?
        } else {
            let applied = ensure_mutable(self.store, stamped).await.map_err(apply_err)?;
            node.stamped = Some(applied.object.clone());
            node.applied = applied.written.then_some(applied.created);
            applied.object
        };

        if let OutputSpec::Deployment(obs) = &tpl.outputs {
            observe(obs, &current).map_err(|source| RealizeError::Observation { resource: resource.to_string(), source })?;
        }
        node.output = extract_output(&tpl, &current, ctx.deployment())
            .map_err(|source| RealizeError::Output { resource: resource.to_string(), source })?;
        Ok(())
    }
}
