//! Well-known label and annotation keys.

use crate::model::{BlueprintKind, OwnerKind, TemplateKind};
use crate::obj::Labels;

pub const RESOURCE_NAME: &str = "carto.run/resource-name";
pub const TEMPLATE_KIND: &str = "carto.run/template-kind";
pub const CLUSTER_TEMPLATE_NAME: &str = "carto.run/cluster-template-name";
pub const TEMPLATE_LIFECYCLE: &str = "carto.run/template-lifecycle";
pub const RUNNABLE_NAME: &str = "carto.run/runnable-name";
pub const RUN_TEMPLATE_NAME: &str = "carto.run/run-template-name";
pub const RUN_FINGERPRINT: &str = "carto.run/run-fingerprint";

pub fn owner_name_key(kind: OwnerKind) -> String {
    format!("carto.run/{}-name", kind.label_stem())
}

pub fn owner_namespace_key(kind: OwnerKind) -> String {
    format!("carto.run/{}-namespace", kind.label_stem())
}

pub fn blueprint_name_key(kind: BlueprintKind) -> &'static str {
    match kind {
        BlueprintKind::SupplyChain => "carto.run/supply-chain-name",
        BlueprintKind::Delivery => "carto.run/delivery-name",
    }
}

/// Labels identifying every object stamped for one blueprint resource of one owner.
pub fn resource_selector(owner: OwnerKind, owner_name: &str, owner_ns: &str, resource: &str) -> Labels {
    let mut l = Labels::new();
    l.insert(owner_name_key(owner), owner_name.to_string());
    l.insert(owner_namespace_key(owner), owner_ns.to_string());
    l.insert(RESOURCE_NAME.to_string(), resource.to_string());
    l
}

/// Who a stamped object belongs to and where it came from.
#[derive(Debug, Clone, Copy)]
pub struct StampIdentity<'a> {
    pub owner_kind: OwnerKind,
    pub owner_name: &'a str,
    pub owner_namespace: &'a str,
    pub blueprint: &'a str,
    pub resource: &'a str,
    pub template_kind: TemplateKind,
    pub template_name: &'a str,
    pub lifecycle: &'a str,
}

impl StampIdentity<'_> {
    /// Full standard label set for a stamped object.
    pub fn labels(&self) -> Labels {
        let mut l = resource_selector(self.owner_kind, self.owner_name, self.owner_namespace, self.resource);
        l.insert(blueprint_name_key(self.owner_kind.blueprint_kind()).to_string(), self.blueprint.to_string());
        l.insert(TEMPLATE_KIND.to_string(), self.template_kind.as_str().to_string());
        l.insert(CLUSTER_TEMPLATE_NAME.to_string(), self.template_name.to_string());
        l.insert(TEMPLATE_LIFECYCLE.to_string(), self.lifecycle.to_string());
        l
    }
}

/// Labels identifying the runs of one runnable.
pub fn runnable_selector(runnable: &str) -> Labels {
    let mut l = Labels::new();
    l.insert(RUNNABLE_NAME.to_string(), runnable.to_string());
    l
}

pub fn run_labels(runnable: &str, run_template: &str) -> Labels {
    let mut l = runnable_selector(runnable);
    l.insert(RUN_TEMPLATE_NAME.to_string(), run_template.to_string());
    l
}
