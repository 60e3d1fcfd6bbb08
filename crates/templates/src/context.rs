use loom_core::model::{InputKind, OwnerKind};
use serde_json::{Map, Value};

use crate::outputs::Output;
use crate::params::Params;

/// Interpolation context for one blueprint resource.
#[derive(Debug, Clone)]
pub struct StampContext {
    owner_kind: OwnerKind,
    owner: Value,
    params: Params,
    inputs: Vec<(String, Output)>,
    deployment: Option<Output>,
}

impl StampContext {
    pub fn new(owner_kind: OwnerKind, owner: Value) -> Self {
        Self { owner_kind, owner, params: Params::new(), inputs: Vec::new(), deployment: None }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn add_input(&mut self, name: &str, output: Output) {
        self.inputs.push((name.to_string(), output));
    }

    pub fn set_deployment(&mut self, output: Output) {
        self.deployment = Some(output);
    }

    pub fn deployment(&self) -> Option<&Output> {
        self.deployment.as_ref()
    }

    /// Input forwarded by a pass-through option, looked up by input name.
    pub fn input(&self, name: &str) -> Option<&Output> {
        self.inputs.iter().find(|(n, _)| n == name).map(|(_, o)| o).or_else(|| {
            if name == InputKind::Deployment.context_key() {
                self.deployment.as_ref()
            } else {
                None
            }
        })
    }

    /// Render the context document. Singular `source`/`image`/`config` keys are bound only
    /// when exactly one input of that kind is present.
    pub fn to_value(&self) -> Value {
        let mut root = Map::new();
        root.insert("owner".into(), self.owner.clone());
        root.insert(self.owner_kind.label_stem().into(), self.owner.clone());
        root.insert("params".into(), Value::Object(self.params.clone().into_iter().collect()));
        for (kind, singular) in [(InputKind::Source, "source"), (InputKind::Image, "image"), (InputKind::Config, "config")] {
            let of_kind: Vec<_> = self.inputs.iter().filter(|(_, o)| input_kind(o) == kind).collect();
            let map: Map<String, Value> = of_kind.iter().map(|(n, o)| (n.clone(), o.input_value(n))).collect();
            root.insert(kind.context_key().into(), Value::Object(map));
            if let [(_, only)] = of_kind.as_slice() {
                root.insert(singular.into(), only.singleton_value());
            }
        }
        if let Some(d) = &self.deployment {
            root.insert(InputKind::Deployment.context_key().into(), d.singleton_value());
        }
        Value::Object(root)
    }
}

// Deployment outputs consumed as sources are bound like sources.
fn input_kind(o: &Output) -> InputKind {
    match o.kind() {
        InputKind::Deployment => InputKind::Source,
        k => k,
    }
}

/// Context for a runnable's run template.
pub fn runnable_context(runnable: &Value, selected: Option<&Value>) -> Value {
    let mut root = Map::new();
    root.insert("runnable".into(), runnable.clone());
    if let Some(s) = selected {
        root.insert("selected".into(), s.clone());
    }
    Value::Object(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn singletons_bound_only_for_single_inputs() {
        let mut ctx = StampContext::new(OwnerKind::Workload, json!({"metadata": {"name": "app"}}));
        ctx.add_input("src", Output::Source { url: json!("u"), revision: json!("r") });
        ctx.add_input("a", Output::Config(json!({"x": 1})));
        ctx.add_input("b", Output::Config(json!({"y": 2})));
        let v = ctx.to_value();
        assert_eq!(v["workload"]["metadata"]["name"], "app");
        assert_eq!(v["owner"], v["workload"]);
        assert_eq!(v["source"]["url"], "u");
        assert_eq!(v["sources"]["src"]["revision"], "r");
        assert!(v.get("config").is_none());
        assert_eq!(v["configs"]["b"]["config"]["y"], 2);
        assert_eq!(v["images"], json!({}));
    }

    #[test]
    fn deployment_is_bound_and_found_by_name() {
        let mut ctx = StampContext::new(OwnerKind::Deliverable, json!({}));
        ctx.set_deployment(Output::Deployment { url: json!("u"), revision: json!("r") });
        let v = ctx.to_value();
        assert_eq!(v["deployment"]["revision"], "r");
        assert!(v.get("deliverable").is_some());
        assert!(ctx.input("deployment").is_some());
        assert!(ctx.input("nope").is_none());
    }
}
