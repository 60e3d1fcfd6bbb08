use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{BlueprintKind, ObjectMeta, ResourceStatus};
use crate::conditions::Condition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    Workload,
    Deliverable,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Workload => "Workload",
            OwnerKind::Deliverable => "Deliverable",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Workload" => Some(OwnerKind::Workload),
            "Deliverable" => Some(OwnerKind::Deliverable),
            _ => None,
        }
    }

    /// Lower-case stem used in labels and as the template context key.
    pub fn label_stem(&self) -> &'static str {
        match self {
            OwnerKind::Workload => "workload",
            OwnerKind::Deliverable => "deliverable",
        }
    }

    pub fn blueprint_kind(&self) -> BlueprintKind {
        match self {
            OwnerKind::Workload => BlueprintKind::SupplyChain,
            OwnerKind::Deliverable => BlueprintKind::Delivery,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerParam {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<OwnerParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Kind-specific fields (`image`, `build`, `env`, `resources`, `serviceClaims`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueprintRef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint_ref: Option<BlueprintRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
}

/// A Workload or Deliverable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: OwnerSpec,
    #[serde(default)]
    pub status: OwnerStatus,
}

impl Owner {
    pub fn owner_kind(&self) -> Option<OwnerKind> {
        OwnerKind::from_kind(&self.kind)
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("")
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or("")
    }

    pub fn has_labels(&self) -> bool {
        self.metadata.labels.as_ref().map(|l| !l.is_empty()).unwrap_or(false)
    }

    pub fn resource_status(&self, name: &str) -> Option<&ResourceStatus> {
        self.status.resources.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn owner_keeps_kind_specific_fields() {
        let raw = json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "Workload",
            "metadata": {"name": "app", "namespace": "dev", "labels": {"type": "web"}, "generation": 2},
            "spec": {
                "source": {"git": {"url": "https://x", "ref": {"branch": "main"}}},
                "params": [{"name": "port", "value": 8080}],
                "image": "registry/app:1",
                "env": [{"name": "A", "value": "b"}]
            }
        });
        let o: Owner = serde_json::from_value(raw).unwrap();
        assert_eq!(o.owner_kind(), Some(OwnerKind::Workload));
        assert!(o.has_labels());
        assert_eq!(o.spec.extra["image"], "registry/app:1");
        let back = serde_json::to_value(&o).unwrap();
        assert_eq!(back["spec"]["env"][0]["name"], "A");
        assert_eq!(back["spec"]["params"][0]["value"], 8080);
        assert_eq!(o.generation(), 2);
    }
}
