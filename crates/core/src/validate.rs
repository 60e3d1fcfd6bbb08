//! Admission-style validation for blueprints, templates, run templates and owners.

use std::collections::{BTreeMap, HashSet};

use loom_schema::{owner_paths, JsonPath};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::model::{
    Blueprint, BlueprintGraph, BlueprintKind, BlueprintResource, HealthRule, OwnerKind, Requirement, ResourceRef,
    RunTemplate, Runnable, Selector, Template, TemplateKind, TemplateOption, TemplateRef,
};
use crate::LoomError;

static QUALIFIED_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").expect("static regex"));
static DNS_SUBDOMAIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("static regex"));
static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

type VResult = Result<(), String>;

/// Label key: optional DNS-subdomain prefix, `/`, qualified name of at most 63 chars.
pub fn validate_label_key(key: &str) -> VResult {
    let (prefix, name) = match key.split_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, key),
    };
    if let Some(p) = prefix {
        if p.is_empty() || p.len() > 253 || !DNS_SUBDOMAIN.is_match(p) {
            return Err(format!("label key [{}] has an invalid prefix", key));
        }
    }
    if name.is_empty() || name.len() > 63 || !QUALIFIED_NAME.is_match(name) {
        return Err(format!("label key [{}] is not a qualified name", key));
    }
    Ok(())
}

pub fn validate_label_value(value: &str) -> VResult {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 63 || !QUALIFIED_NAME.is_match(value) {
        return Err(format!("label value [{}] is invalid", value));
    }
    Ok(())
}

fn validate_labels(labels: &BTreeMap<String, String>) -> VResult {
    for (k, v) in labels {
        validate_label_key(k)?;
        validate_label_value(v)?;
    }
    Ok(())
}

fn validate_operator_values(req: &Requirement) -> VResult {
    match (req.operator.takes_values(), req.values.is_empty()) {
        (false, false) => Err(format!("cannot specify values with operator [{}]", req.operator)),
        (true, true) => Err(format!("must specify values with operator [{}]", req.operator)),
        _ => Ok(()),
    }
}

fn validate_expressions(reqs: &[Requirement]) -> VResult {
    for req in reqs {
        validate_label_key(&req.key)?;
        validate_operator_values(req)?;
        for v in &req.values {
            validate_label_value(v)?;
        }
    }
    Ok(())
}

/// Field requirements: operator/value shape plus a key the owner kind exposes.
pub fn validate_field_requirements(reqs: &[Requirement], owner: OwnerKind) -> VResult {
    let paths = owner_paths(owner.as_str()).ok_or_else(|| format!("no field paths for kind [{}]", owner.as_str()))?;
    for req in reqs {
        validate_operator_values(req)?;
        if !paths.allows(&req.key) {
            return Err(format!("requirement key [{}] is not a valid path", req.key));
        }
        JsonPath::parse(loom_schema::normalize_owner_key(&req.key))
            .map_err(|e| format!("invalid jsonpath for key [{}]: {}", req.key, e))?;
    }
    Ok(())
}

fn validate_option_selector(sel: &Selector, owner: OwnerKind) -> VResult {
    if sel.is_empty() {
        return Err("at least one of matchLabels, matchExpressions or MatchFields must be specified".into());
    }
    validate_labels(&sel.match_labels).map_err(|e| format!("matchLabels are not valid: {}", e))?;
    validate_expressions(&sel.match_expressions).map_err(|e| format!("matchExpressions are not valid: {}", e))?;
    validate_field_requirements(&sel.match_fields, owner)
}

pub fn validate_options(options: &[TemplateOption], owner: OwnerKind) -> VResult {
    let pass_through = options.iter().filter(|o| o.pass_through.is_some()).count();
    if pass_through > 1 {
        return Err(format!("cannot have more than one pass through option, found {}", pass_through));
    }
    for opt in options {
        match (&opt.name, &opt.pass_through) {
            (Some(_), Some(_)) => {
                return Err("exactly one of option.Name or option.PassThrough must be specified, found both".into())
            }
            (None, None) => {
                return Err("exactly one of option.Name or option.PassThrough must be specified, found neither".into())
            }
            _ => {}
        }
        validate_option_selector(&opt.selector, owner)
            .map_err(|e| format!("error validating option [{}] selector: {}", opt.label(), e))?;
    }
    for (i, a) in options.iter().enumerate() {
        for b in &options[i + 1..] {
            if a.selector == b.selector {
                return Err(format!("duplicate selector found in options [{}, {}]", a.label(), b.label()));
            }
        }
    }
    Ok(())
}

pub fn validate_template_ref(tref: &TemplateRef, owner: OwnerKind) -> VResult {
    match (&tref.name, tref.options.is_empty()) {
        (Some(_), false) => {
            Err("exactly one of templateRef.Name or templateRef.Options must be specified, found both".into())
        }
        (None, true) => {
            Err("exactly one of templateRef.Name or templateRef.Options must be specified, found neither".into())
        }
        (None, false) if tref.options.len() < 2 => Err("templateRef.Options must have more than one option".into()),
        (None, false) => validate_options(&tref.options, owner),
        (Some(_), true) => Ok(()),
    }
}

fn allowed_template_kinds(bp: BlueprintKind) -> &'static [TemplateKind] {
    match bp {
        BlueprintKind::SupplyChain => {
            &[TemplateKind::Plain, TemplateKind::Source, TemplateKind::Image, TemplateKind::Config]
        }
        BlueprintKind::Delivery => {
            &[TemplateKind::Plain, TemplateKind::Source, TemplateKind::Config, TemplateKind::Deployment]
        }
    }
}

fn producer_kind(bp: &Blueprint, resource: &str) -> Option<TemplateKind> {
    bp.spec.resource(resource).and_then(|r| r.template_ref.template_kind())
}

fn validate_refs(bp: &Blueprint, refs: &[ResourceRef], accepted: &[TemplateKind]) -> VResult {
    for r in refs {
        let kind = match bp.spec.resource(&r.resource) {
            Some(res) => res.template_ref.template_kind(),
            None => return Err(format!("[{}] is provided by unknown resource [{}]", r.name, r.resource)),
        };
        if !kind.map(|k| accepted.contains(&k)).unwrap_or(false) {
            let names: Vec<&str> = accepted.iter().map(|k| k.as_str()).collect();
            return Err(format!(
                "resource [{}] providing [{}] must reference a {}",
                r.resource,
                r.name,
                names.join(" or ")
            ));
        }
    }
    Ok(())
}

fn validate_resource_inputs(bp: &Blueprint, kind: BlueprintKind, res: &BlueprintResource) -> VResult {
    let source_kinds: &[TemplateKind] = match kind {
        BlueprintKind::SupplyChain => &[TemplateKind::Source],
        BlueprintKind::Delivery => &[TemplateKind::Source, TemplateKind::Deployment],
    };
    validate_refs(bp, &res.sources, source_kinds).map_err(|e| format!("invalid sources for resource [{}]: {}", res.name, e))?;
    validate_refs(bp, &res.images, &[TemplateKind::Image]).map_err(|e| format!("invalid images for resource [{}]: {}", res.name, e))?;
    validate_refs(bp, &res.configs, &[TemplateKind::Config]).map_err(|e| format!("invalid configs for resource [{}]: {}", res.name, e))?;

    let is_deployment = res.template_ref.template_kind() == Some(TemplateKind::Deployment);
    match (kind, &res.deployment) {
        (BlueprintKind::SupplyChain, Some(_)) => {
            return Err(format!("resource [{}] cannot receive a deployment in a ClusterSupplyChain", res.name))
        }
        (BlueprintKind::Delivery, None) if is_deployment => {
            return Err(format!("spec.resources[{}] is a ClusterDeploymentTemplate and must receive a deployment", res.name))
        }
        (BlueprintKind::Delivery, Some(_)) if !is_deployment => {
            return Err(format!("spec.resources[{}] receives a deployment but is not a ClusterDeploymentTemplate", res.name))
        }
        (BlueprintKind::Delivery, Some(d)) => {
            if producer_kind(bp, &d.resource).is_none() {
                return Err(format!("[deployment] is provided by unknown resource [{}]", d.resource));
            }
            if is_deployment && !res.configs.is_empty() {
                return Err(format!("spec.resources[{}] is a ClusterDeploymentTemplate and must not receive config", res.name));
            }
        }
        _ => {}
    }
    Ok(())
}

fn validate_blueprint_inner(bp: &Blueprint, kind: BlueprintKind) -> Result<BlueprintGraph, String> {
    let spec = &bp.spec;
    let selector = spec.selector();
    if selector.is_empty() {
        return Err("at least one selector, selectorMatchExpression, selectorMatchField must be specified".into());
    }
    validate_labels(&spec.selector).map_err(|e| format!("selector is not valid: {}", e))?;
    validate_expressions(&spec.selector_match_expressions)
        .map_err(|e| format!("selectorMatchExpressions are not valid: {}", e))?;
    validate_field_requirements(&spec.selector_match_fields, kind.owner_kind())
        .map_err(|e| format!("selectorMatchFields are not valid: {}", e))?;

    for p in &spec.params {
        p.validate().map_err(|e| e.message().to_string())?;
    }
    for res in &spec.resources {
        for p in &res.params {
            p.validate().map_err(|e| format!("resource [{}] is invalid: {}", res.name, e.message()))?;
        }
    }

    let mut names = HashSet::new();
    for res in &spec.resources {
        if !names.insert(res.name.as_str()) {
            return Err(format!("duplicate resource name [{}] found", res.name));
        }
    }

    for res in &spec.resources {
        let mut option_names = HashSet::new();
        for opt in res.template_ref.options.iter().filter_map(|o| o.name.as_deref()) {
            if !option_names.insert(opt) {
                return Err(format!("duplicate template name [{}] found in options for resource [{}]", opt, res.name));
            }
        }
    }

    let allowed = allowed_template_kinds(kind);
    for res in &spec.resources {
        validate_template_ref(&res.template_ref, kind.owner_kind())
            .map_err(|e| format!("error validating resource [{}]: {}", res.name, e))?;
        match res.template_ref.template_kind() {
            Some(k) if allowed.contains(&k) => {}
            _ => {
                return Err(format!(
                    "resource [{}] uses template kind [{}] which is not allowed in a {}",
                    res.name,
                    res.template_ref.kind,
                    kind.as_str()
                ))
            }
        }
    }

    for res in &spec.resources {
        validate_resource_inputs(bp, kind, res)?;
    }

    BlueprintGraph::build(spec).map_err(|e| e.message().to_string())
}

/// Validate a ClusterSupplyChain or ClusterDelivery and index its resources.
pub fn validate_blueprint(bp: &Blueprint) -> Result<BlueprintGraph, LoomError> {
    let kind = bp
        .blueprint_kind()
        .ok_or_else(|| LoomError::validation(format!("unsupported blueprint kind [{}]", bp.kind)))?;
    validate_blueprint_inner(bp, kind).map_err(|e| {
        LoomError::Validation(format!("error validating {} [{}]: {}", kind.as_str().to_lowercase(), bp.name(), e))
    })
}

fn body_namespace(body: &Value) -> Option<&str> {
    body.get("metadata").and_then(|m| m.get("namespace")).and_then(|n| n.as_str()).filter(|s| !s.is_empty())
}

fn validate_health_rule(rule: &HealthRule) -> VResult {
    let set = [rule.always_healthy.is_some(), rule.single_condition_type.is_some(), rule.multi_match.is_some()]
        .into_iter()
        .filter(|b| *b)
        .count();
    match set {
        0 => return Err("invalid health rule: must specify one of alwaysHealthy, singleConditionType or multiMatch, found neither".into()),
        1 => {}
        _ => return Err("invalid health rule: must specify one of alwaysHealthy, singleConditionType or multiMatch, found multiple".into()),
    }
    if let Some(mm) = &rule.multi_match {
        if mm.unhealthy.is_empty() {
            return Err("invalid multi match health rule: unhealthy rule has no matchFields or matchConditions".into());
        }
        if mm.healthy.is_empty() {
            return Err("invalid multi match health rule: healthy rule has no matchFields or matchConditions".into());
        }
        for f in mm.healthy.match_fields.iter().chain(mm.unhealthy.match_fields.iter()) {
            JsonPath::parse(&f.key).map_err(|e| format!("invalid health rule: {}", e))?;
            let req = Requirement { key: f.key.clone(), operator: f.operator, values: f.values.clone() };
            validate_operator_values(&req).map_err(|e| format!("invalid health rule: {}", e))?;
        }
    }
    Ok(())
}

fn require_path(field: &str, path: &Option<String>) -> VResult {
    match path {
        Some(p) => JsonPath::parse(p).map(|_| ()).map_err(|e| format!("invalid spec: {}: {}", field, e)),
        None => Err(format!("invalid spec: {} is required", field)),
    }
}

fn validate_template_inner(t: &Template, kind: TemplateKind) -> VResult {
    let spec = &t.spec;
    match (&spec.template, &spec.ytt) {
        (None, None) => return Err("invalid template: must specify one of template or ytt, found neither".into()),
        (Some(_), Some(_)) => return Err("invalid template: must specify one of template or ytt, found both".into()),
        (Some(body), None) => {
            if !body.is_object() {
                return Err("invalid template: failed to parse object metadata: template is not an object".into());
            }
            if body_namespace(body).is_some() {
                return Err("invalid template: template should not set metadata.namespace on the child object".into());
            }
        }
        (None, Some(_)) => {}
    }
    if !spec.lifecycle.is_immutable() && spec.retention_policy.is_some() {
        return Err("invalid template: if lifecycle is mutable, no retention policy may be set".into());
    }
    if let Some(rp) = &spec.retention_policy {
        if rp.max_failed_runs < 1 || rp.max_successful_runs < 1 {
            return Err("invalid template: retention policy values must be at least 1".into());
        }
    }
    if let Some(rule) = &spec.health_rule {
        validate_health_rule(rule)?;
    }
    let mut param_names = HashSet::new();
    for p in &spec.params {
        if !param_names.insert(p.name.as_str()) {
            return Err(format!("invalid template: duplicate param [{}]", p.name));
        }
    }
    match kind {
        TemplateKind::Plain => Ok(()),
        TemplateKind::Source => {
            require_path("urlPath", &spec.url_path)?;
            require_path("revisionPath", &spec.revision_path)
        }
        TemplateKind::Image => require_path("imagePath", &spec.image_path),
        TemplateKind::Config => require_path("configPath", &spec.config_path),
        TemplateKind::Deployment => {
            if spec.observed_completion.is_some() == !spec.observed_matches.is_empty() {
                return Err("invalid spec: must set exactly one of spec.ObservedMatches and spec.ObservedCompletion".into());
            }
            if let Some(oc) = &spec.observed_completion {
                JsonPath::parse(&oc.succeeded.key).map_err(|e| format!("invalid spec: observedCompletion: {}", e))?;
                if let Some(f) = &oc.failed {
                    JsonPath::parse(&f.key).map_err(|e| format!("invalid spec: observedCompletion: {}", e))?;
                }
            }
            for m in &spec.observed_matches {
                JsonPath::parse(&m.input).map_err(|e| format!("invalid spec: observedMatches: {}", e))?;
                JsonPath::parse(&m.output).map_err(|e| format!("invalid spec: observedMatches: {}", e))?;
            }
            Ok(())
        }
    }
}

/// Validate one of the five template kinds.
pub fn validate_template(t: &Template) -> Result<(), LoomError> {
    let kind = t
        .template_kind()
        .ok_or_else(|| LoomError::validation(format!("unsupported template kind [{}]", t.kind)))?;
    validate_template_inner(t, kind).map_err(|e| {
        LoomError::Validation(format!("error validating {} [{}]: {}", kind.as_str().to_lowercase(), t.name(), e))
    })
}

pub fn validate_run_template(rt: &RunTemplate) -> Result<(), LoomError> {
    let wrap = |e: &str| LoomError::Validation(format!("error validating clusterruntemplate [{}]: {}", rt.name(), e));
    let body = rt.spec.template.as_object().ok_or_else(|| wrap("invalid template: failed to parse object"))?;
    if body_namespace(&rt.spec.template).is_some() {
        return Err(wrap("invalid template: template should not set metadata.namespace on the child object"));
    }
    if !body.contains_key("spec") {
        return Err(wrap("invalid template: object must have a spec"));
    }
    for (name, path) in &rt.spec.outputs {
        JsonPath::parse(path).map_err(|e| wrap(&format!("invalid output [{}]: {}", name, e)))?;
    }
    Ok(())
}

fn validate_name(name: &str) -> VResult {
    if name.len() > 63 || !DNS_LABEL.is_match(name) {
        return Err(format!("name [{}] must be a DNS label of at most 63 characters", name));
    }
    Ok(())
}

/// Owner admission: the name must be usable as a label value on stamped objects.
pub fn validate_owner_name(kind: OwnerKind, name: &str) -> Result<(), LoomError> {
    validate_name(name)
        .map_err(|e| LoomError::Validation(format!("error validating {} [{}]: {}", kind.label_stem(), name, e)))
}

pub fn validate_runnable(r: &Runnable) -> Result<(), LoomError> {
    let wrap = |e: String| LoomError::Validation(format!("error validating runnable [{}]: {}", r.name(), e));
    validate_name(r.name()).map_err(wrap)?;
    if r.spec.run_template_ref.name.is_empty() {
        return Err(wrap("runTemplateRef.name is required".into()));
    }
    let rp = r.spec.retention_policy;
    if rp.max_failed_runs < 1 || rp.max_successful_runs < 1 {
        return Err(wrap("retentionPolicy values must be at least 1".into()));
    }
    if let Some(sel) = &r.spec.selector {
        validate_labels(&sel.matching_labels).map_err(wrap)?;
    }
    Ok(())
}
