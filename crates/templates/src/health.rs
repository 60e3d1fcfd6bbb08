//! Per-resource `Healthy` condition from a template's health rule.

use loom_core::conditions::{condition_type_reason, Condition, ConditionStatus, ConditionType, Reason};
use loom_core::model::{FieldMatcher, HealthRule, MatchSet, MultiMatchRule, Requirement, ResourceStatus, TemplateKind};
use loom_core::obj;
use loom_schema::lookup;
use loom_selector::field_matches;
use serde_json::Value;
use tracing::warn;

/// What the realizer knows about one resource when judging its health.
#[derive(Debug, Clone, Copy, Default)]
pub struct Realized<'a> {
    pub template_kind: Option<TemplateKind>,
    pub has_stamped_ref: bool,
    pub has_outputs: bool,
    pub stamped: Option<&'a Value>,
}

fn healthy(status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>) -> Condition {
    Condition::new(ConditionType::Healthy, status, reason, message)
}

/// Evaluate `rule` for one realized resource (`None` when nothing was realized).
pub fn evaluate_health(rule: Option<&HealthRule>, realized: Option<&Realized<'_>>) -> Condition {
    let Some(rule) = rule else {
        return default_health(realized);
    };
    if rule.always_healthy.is_some() {
        return healthy(ConditionStatus::True, Reason::AlwaysHealthy, "");
    }
    if let Some(stamped) = realized.and_then(|r| r.stamped) {
        if let Some(t) = rule.single_condition_type.as_deref().filter(|t| !t.is_empty()) {
            return single_condition(t, stamped);
        }
        if let Some(mm) = &rule.multi_match {
            return multi_match(mm, stamped);
        }
    }
    healthy(ConditionStatus::Unknown, Reason::Unknown, "")
}

fn default_health(realized: Option<&Realized<'_>>) -> Condition {
    match realized {
        None => healthy(ConditionStatus::Unknown, Reason::NoResource, ""),
        Some(r) if r.has_outputs => healthy(ConditionStatus::True, Reason::OutputAvailable, ""),
        Some(r) if r.template_kind == Some(TemplateKind::Plain) => {
            if r.has_stamped_ref {
                healthy(ConditionStatus::True, Reason::AlwaysHealthy, "")
            } else {
                healthy(ConditionStatus::Unknown, Reason::NoStampedObject, "")
            }
        }
        Some(_) => healthy(ConditionStatus::Unknown, Reason::OutputNotAvailable, ""),
    }
}

fn single_condition(type_: &str, stamped: &Value) -> Condition {
    let reason = condition_type_reason(type_);
    match obj::condition(stamped, type_) {
        Some(c) => healthy(c.status, reason, c.message),
        None => healthy(
            ConditionStatus::Unknown,
            reason,
            format!("condition with type [{}] not found on resource status", type_),
        ),
    }
}

fn requirement(f: &FieldMatcher) -> Requirement {
    Requirement { key: f.key.clone(), operator: f.operator, values: f.values.clone() }
}

fn render(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn field_message(f: &FieldMatcher, stamped: &Value) -> String {
    let field = match lookup(&f.key, stamped) {
        Ok(Some(v)) => render(v),
        _ => "<error retrieving field value>".to_string(),
    };
    let message = match f.message_path.as_deref().map(|p| (p, lookup(p, stamped))) {
        Some((_, Ok(Some(v)))) => render(v),
        Some((p, _)) => format!("unknown, error retrieving message path [{}]", p),
        None => String::new(),
    };
    format!("field value: {}, message: {}", field, message)
}

fn condition_matches(type_: &str, status: &str, stamped: &Value) -> Option<Condition> {
    obj::condition(stamped, type_).filter(|c| c.status.as_str() == status)
}

fn condition_message(c: &Condition) -> String {
    format!("condition status: {}, message: {}", c.status, c.message)
}

fn field_holds(f: &FieldMatcher, stamped: &Value) -> Result<bool, String> {
    field_matches(&requirement(f), stamped).map_err(|e| {
        warn!(key = %f.key, error = %e, "unable to evaluate health field");
        format!("error evaluating field [{}]: {}", f.key, e)
    })
}

fn any_unhealthy(set: &MatchSet, stamped: &Value) -> Result<Option<Condition>, String> {
    for m in &set.match_conditions {
        if let Some(c) = condition_matches(&m.type_, &m.status, stamped) {
            return Ok(Some(healthy(ConditionStatus::False, Reason::MatchedCondition, condition_message(&c))));
        }
    }
    for f in &set.match_fields {
        if field_holds(f, stamped)? {
            return Ok(Some(healthy(ConditionStatus::False, Reason::MatchedField, field_message(f, stamped))));
        }
    }
    Ok(None)
}

fn all_healthy(set: &MatchSet, stamped: &Value) -> Result<Option<Condition>, String> {
    let mut first: Option<(Reason, String)> = None;
    for m in &set.match_conditions {
        let Some(c) = condition_matches(&m.type_, &m.status, stamped) else {
            return Ok(None);
        };
        first.get_or_insert_with(|| (Reason::MatchedCondition, condition_message(&c)));
    }
    for f in &set.match_fields {
        if !field_holds(f, stamped)? {
            return Ok(None);
        }
        first.get_or_insert_with(|| (Reason::MatchedField, field_message(f, stamped)));
    }
    Ok(first.map(|(reason, message)| healthy(ConditionStatus::True, reason, message)))
}

fn multi_match(rule: &MultiMatchRule, stamped: &Value) -> Condition {
    let found = match any_unhealthy(&rule.unhealthy, stamped) {
        Ok(None) => all_healthy(&rule.healthy, stamped),
        other => other,
    };
    match found {
        Ok(Some(c)) => c,
        Ok(None) => healthy(ConditionStatus::Unknown, Reason::NoMatchesFulfilled, ""),
        Err(message) => healthy(ConditionStatus::Unknown, Reason::NoMatchesFulfilled, message),
    }
}

/// Owner `ResourcesHealthy`: the reduction of every resource's `Healthy` condition.
pub fn owner_health(resources: &[ResourceStatus]) -> Condition {
    let subs: Vec<Condition> =
        resources.iter().filter_map(|r| r.condition(ConditionType::Healthy.as_str()).cloned()).collect();
    let mut c = loom_core::conditions::reduce(ConditionType::ResourcesHealthy, &subs);
    c.reason = Reason::HealthyConditionRule.into();
    c
}
