use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ObjectMeta, OwnerKind, Requirement, Selector, TemplateKind};
use crate::conditions::{find, Condition, ConditionType};
use crate::LoomError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlueprintKind {
    SupplyChain,
    Delivery,
}

impl BlueprintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlueprintKind::SupplyChain => "ClusterSupplyChain",
            BlueprintKind::Delivery => "ClusterDelivery",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "ClusterSupplyChain" => Some(BlueprintKind::SupplyChain),
            "ClusterDelivery" => Some(BlueprintKind::Delivery),
            _ => None,
        }
    }

    pub fn owner_kind(&self) -> OwnerKind {
        match self {
            BlueprintKind::SupplyChain => OwnerKind::Workload,
            BlueprintKind::Delivery => OwnerKind::Deliverable,
        }
    }

    /// Owner condition reporting blueprint selection.
    pub fn ready_condition(&self) -> ConditionType {
        match self {
            BlueprintKind::SupplyChain => ConditionType::SupplyChainReady,
            BlueprintKind::Delivery => ConditionType::DeliveryReady,
        }
    }
}

/// `{name, value | default}` on blueprints and blueprint resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn validate(&self) -> Result<(), LoomError> {
        if self.value.is_some() == self.default.is_some() {
            return Err(LoomError::validation(format!(
                "param [{}] is invalid: must set exactly one of value and default",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// `{name, resource}`: input `name` provided by blueprint resource `resource`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub name: String,
    pub resource: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRef {
    pub resource: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateOption {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_through: Option<String>,
    #[serde(default)]
    pub selector: Selector,
}

impl TemplateOption {
    /// Template name, or the pass-through input name.
    pub fn label(&self) -> &str {
        self.name.as_deref().or(self.pass_through.as_deref()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<TemplateOption>,
}

impl TemplateRef {
    pub fn template_kind(&self) -> Option<TemplateKind> {
        TemplateKind::from_kind(&self.kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintResource {
    pub name: String,
    pub template_ref: TemplateRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ResourceRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ResourceRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintSpec {
    #[serde(default)]
    pub resources: Vec<BlueprintResource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selector_match_expressions: Vec<Requirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selector_match_fields: Vec<Requirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_ref: Option<ServiceAccountRef>,
}

impl BlueprintSpec {
    pub fn selector(&self) -> Selector {
        Selector {
            match_labels: self.selector.clone(),
            match_expressions: self.selector_match_expressions.clone(),
            match_fields: self.selector_match_fields.clone(),
        }
    }

    pub fn resource(&self, name: &str) -> Option<&BlueprintResource> {
        self.resources.iter().find(|r| r.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: BlueprintSpec,
    #[serde(default)]
    pub status: BlueprintStatus,
}

impl Blueprint {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn blueprint_kind(&self) -> Option<BlueprintKind> {
        BlueprintKind::from_kind(&self.kind)
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn is_ready(&self) -> bool {
        find(&self.status.conditions, ConditionType::Ready.as_str()).map(|c| c.is_true()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    Source,
    Image,
    Config,
    Deployment,
}

impl InputKind {
    /// Template context key holding inputs of this kind.
    pub fn context_key(&self) -> &'static str {
        match self {
            InputKind::Source => "sources",
            InputKind::Image => "images",
            InputKind::Config => "configs",
            InputKind::Deployment => "deployment",
        }
    }
}

/// Input `name` of kind `kind`, produced by the resource at index `producer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEdge {
    pub kind: InputKind,
    pub name: String,
    pub producer: usize,
}

/// Resources indexed by name; inputs point at earlier resources by index.
#[derive(Debug, Clone, Default)]
pub struct BlueprintGraph {
    names: Vec<String>,
    inputs: Vec<Vec<InputEdge>>,
    by_name: FxHashMap<String, usize>,
}

impl BlueprintGraph {
    /// Index the resources. Every input must name a resource declared earlier.
    pub fn build(spec: &BlueprintSpec) -> Result<Self, LoomError> {
        let mut g = BlueprintGraph::default();
        for (idx, res) in spec.resources.iter().enumerate() {
            if g.by_name.insert(res.name.clone(), idx).is_some() {
                return Err(LoomError::validation(format!("duplicate resource name [{}] found", res.name)));
            }
            let mut edges = Vec::new();
            let refs = res
                .sources
                .iter()
                .map(|r| (InputKind::Source, r.name.as_str(), r.resource.as_str()))
                .chain(res.images.iter().map(|r| (InputKind::Image, r.name.as_str(), r.resource.as_str())))
                .chain(res.deployment.iter().map(|d| (InputKind::Deployment, "deployment", d.resource.as_str())))
                .chain(res.configs.iter().map(|r| (InputKind::Config, r.name.as_str(), r.resource.as_str())));
            for (kind, name, producer) in refs {
                let p = match g.by_name.get(producer) {
                    Some(p) if *p < idx => *p,
                    _ if spec.resources.iter().any(|r| r.name == producer) => {
                        return Err(LoomError::validation(format!(
                            "resource [{}] references [{}] which is not declared before it",
                            res.name, producer
                        )))
                    }
                    _ => {
                        return Err(LoomError::validation(format!(
                            "[{}] is provided by unknown resource [{}]",
                            name, producer
                        )))
                    }
                };
                edges.push(InputEdge { kind, name: name.to_string(), producer: p });
            }
            g.names.push(res.name.clone());
            g.inputs.push(edges);
        }
        Ok(g)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, idx: usize) -> &str {
        self.names.get(idx).map(|s| s.as_str()).unwrap_or("")
    }

    /// Inputs in the order sources, images, deployment, configs.
    pub fn inputs(&self, idx: usize) -> &[InputEdge] {
        self.inputs.get(idx).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Whether `node` consumes the output of `ancestor`, directly or transitively.
    pub fn depends_on(&self, node: usize, ancestor: usize) -> bool {
        self.inputs(node).iter().any(|e| e.producer == ancestor || self.depends_on(e.producer, ancestor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(name: &str, kind: &str, sources: &[(&str, &str)]) -> BlueprintResource {
        BlueprintResource {
            name: name.into(),
            template_ref: TemplateRef { kind: kind.into(), name: Some(format!("{}-tpl", name)), options: vec![] },
            sources: sources.iter().map(|(n, r)| ResourceRef { name: (*n).into(), resource: (*r).into() }).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn graph_indexes_inputs_by_position() {
        let spec = BlueprintSpec {
            resources: vec![
                res("src", "ClusterSourceTemplate", &[]),
                res("test", "ClusterSourceTemplate", &[("source", "src")]),
                res("build", "ClusterImageTemplate", &[("source", "test")]),
            ],
            ..Default::default()
        };
        let g = BlueprintGraph::build(&spec).unwrap();
        assert_eq!(g.len(), 3);
        assert_eq!(g.inputs(2)[0].producer, 1);
        assert!(g.depends_on(2, 0));
        assert!(!g.depends_on(1, 2));
        assert_eq!(g.index("build"), Some(2));
    }

    #[test]
    fn graph_rejects_forward_and_unknown_references() {
        let spec = BlueprintSpec {
            resources: vec![res("a", "ClusterSourceTemplate", &[("s", "b")]), res("b", "ClusterSourceTemplate", &[])],
            ..Default::default()
        };
        let e = BlueprintGraph::build(&spec).unwrap_err();
        assert!(e.message().contains("not declared before"), "{}", e);

        let spec = BlueprintSpec { resources: vec![res("a", "ClusterSourceTemplate", &[("s", "zzz")])], ..Default::default() };
        assert_eq!(
            BlueprintGraph::build(&spec).unwrap_err().message(),
            "[s] is provided by unknown resource [zzz]"
        );
    }

    #[test]
    fn param_spec_requires_exactly_one_of_value_and_default() {
        let p = ParamSpec { name: "p".into(), ..Default::default() };
        assert_eq!(p.validate().unwrap_err().message(), "param [p] is invalid: must set exactly one of value and default");
        let p = ParamSpec { name: "p".into(), value: Some(1.into()), default: Some(2.into()) };
        assert!(p.validate().is_err());
        let p = ParamSpec { name: "p".into(), value: Some(1.into()), default: None };
        assert!(p.validate().is_ok());
    }
}
