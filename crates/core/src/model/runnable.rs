use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ObjectMeta, RetentionPolicy, RUN_TEMPLATE_KIND};
use crate::conditions::Condition;

pub const RUNNABLE_KIND: &str = "Runnable";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTemplateRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub name: String,
}

impl RunTemplateRef {
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(RUN_TEMPLATE_KIND)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceType {
    pub api_version: String,
    pub kind: String,
}

/// Picks the single auxiliary object exposed to the run template as `selected`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableSelector {
    pub resource: ResourceType,
    #[serde(default)]
    pub matching_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableSpec {
    pub run_template_ref: RunTemplateRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<RunnableSelector>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runnable {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: RunnableSpec,
    #[serde(default)]
    pub status: RunnableStatus,
}

impl Runnable {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("")
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn service_account(&self) -> &str {
        self.spec.service_account_name.as_deref().filter(|s| !s.is_empty()).unwrap_or("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn runnable_defaults() {
        let r: Runnable = serde_json::from_value(json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "Runnable",
            "metadata": {"name": "tests", "namespace": "dev"},
            "spec": {"runTemplateRef": {"name": "tekton-run"}, "inputs": {"revision": "abc"}}
        }))
        .unwrap();
        assert_eq!(r.spec.retention_policy, RetentionPolicy { max_failed_runs: 10, max_successful_runs: 10 });
        assert_eq!(r.spec.run_template_ref.kind(), "ClusterRunTemplate");
        assert_eq!(r.service_account(), "default");
        assert_eq!(r.spec.inputs["revision"], "abc");
    }
}
