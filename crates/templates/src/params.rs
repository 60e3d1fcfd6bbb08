use std::collections::BTreeMap;

use loom_core::model::{OwnerParam, ParamSpec, TemplateParam};
use serde_json::Value;

pub type Params = BTreeMap<String, Value>;

fn value_of<'a>(specs: &'a [ParamSpec], name: &str) -> Option<&'a Value> {
    specs.iter().find(|p| p.name == name).and_then(|p| p.value.as_ref())
}

fn default_of<'a>(specs: &'a [ParamSpec], name: &str) -> Option<&'a Value> {
    specs.iter().find(|p| p.name == name).and_then(|p| p.default.as_ref())
}

/// Merge parameters for one template. Highest precedence first: resource `value`,
/// blueprint `value`, owner param, resource `default`, blueprint `default`, template default.
/// Only names the template declares are emitted.
pub fn resolve_params(
    declared: &[TemplateParam],
    resource: &[ParamSpec],
    blueprint: &[ParamSpec],
    owner: &[OwnerParam],
) -> Params {
    declared
        .iter()
        .map(|tp| {
            let name = tp.name.as_str();
            let v = value_of(resource, name)
                .or_else(|| value_of(blueprint, name))
                .or_else(|| owner.iter().find(|p| p.name == name).map(|p| &p.value))
                .or_else(|| default_of(resource, name))
                .or_else(|| default_of(blueprint, name))
                .unwrap_or(&tp.default);
            (tp.name.clone(), v.clone())
        })
        .collect()
}
