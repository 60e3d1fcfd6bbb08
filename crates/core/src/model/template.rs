use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{InputKind, ObjectMeta, Operator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    Plain,
    Source,
    Image,
    Config,
    Deployment,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 5] =
        [TemplateKind::Plain, TemplateKind::Source, TemplateKind::Image, TemplateKind::Config, TemplateKind::Deployment];

    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::Plain => "ClusterTemplate",
            TemplateKind::Source => "ClusterSourceTemplate",
            TemplateKind::Image => "ClusterImageTemplate",
            TemplateKind::Config => "ClusterConfigTemplate",
            TemplateKind::Deployment => "ClusterDeploymentTemplate",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    /// Input kind this template's output feeds downstream, if any.
    pub fn output_kind(&self) -> Option<InputKind> {
        match self {
            TemplateKind::Plain => None,
            TemplateKind::Source => Some(InputKind::Source),
            TemplateKind::Image => Some(InputKind::Image),
            TemplateKind::Config => Some(InputKind::Config),
            TemplateKind::Deployment => Some(InputKind::Deployment),
        }
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    #[default]
    Mutable,
    Immutable,
    Tekton,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Mutable => "mutable",
            Lifecycle::Immutable => "immutable",
            Lifecycle::Tekton => "tekton",
        }
    }

    /// `tekton` behaves like `immutable`.
    pub fn is_immutable(&self) -> bool {
        !matches!(self, Lifecycle::Mutable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(default = "default_retained")]
    pub max_failed_runs: u32,
    #[serde(default = "default_retained")]
    pub max_successful_runs: u32,
}

fn default_retained() -> u32 {
    10
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { max_failed_runs: 10, max_successful_runs: 10 }
    }
}

/// Template-declared parameter and its default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateParam {
    pub name: String,
    #[serde(default)]
    pub default: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionMatcher {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMatcher {
    pub key: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<ConditionMatcher>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_fields: Vec<FieldMatcher>,
}

impl MatchSet {
    pub fn is_empty(&self) -> bool {
        self.match_conditions.is_empty() && self.match_fields.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiMatchRule {
    #[serde(default)]
    pub healthy: MatchSet,
    #[serde(default)]
    pub unhealthy: MatchSet,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always_healthy: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_condition_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_match: Option<MultiMatchRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedCompletion {
    pub succeeded: KeyValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<KeyValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedMatch {
    pub input: String,
    pub output: String,
}

/// Spec shared by all five template kinds; kind-specific fields are optional here and
/// checked per kind at validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ytt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<TemplateParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_rule: Option<HealthRule>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<RetentionPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_completion: Option<ObservedCompletion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observed_matches: Vec<ObservedMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: TemplateSpec,
}

impl Template {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn template_kind(&self) -> Option<TemplateKind> {
        TemplateKind::from_kind(&self.kind)
    }
}

pub const RUN_TEMPLATE_KIND: &str = "ClusterRunTemplate";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTemplateSpec {
    #[serde(default)]
    pub template: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTemplate {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RunTemplateSpec,
}

impl RunTemplate {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn template_parses_kind_specific_fields() {
        let t: Template = serde_json::from_value(json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "ClusterSourceTemplate",
            "metadata": {"name": "git"},
            "spec": {
                "urlPath": ".status.artifact.url",
                "revisionPath": ".status.artifact.revision",
                "template": {"kind": "GitRepository"},
                "healthRule": {"singleConditionType": "Ready"},
                "lifecycle": "immutable",
                "retentionPolicy": {"maxFailedRuns": 2}
            }
        }))
        .unwrap();
        assert_eq!(t.template_kind(), Some(TemplateKind::Source));
        assert!(t.spec.lifecycle.is_immutable());
        assert_eq!(t.spec.retention_policy, Some(RetentionPolicy { max_failed_runs: 2, max_successful_runs: 10 }));
        assert_eq!(t.spec.health_rule.unwrap().single_condition_type.as_deref(), Some("Ready"));
    }

    #[test]
    fn multi_match_rejects_unknown_operator() {
        let r: Result<HealthRule, _> = serde_json::from_value(json!({
            "multiMatch": {"healthy": {"matchFields": [{"key": "status.x", "operator": "Bogus"}]}}
        }));
        assert!(r.unwrap_err().to_string().contains("operator [Bogus] is invalid"));
    }

    #[test]
    fn kinds_round_trip_through_names() {
        for k in TemplateKind::ALL {
            assert_eq!(TemplateKind::from_kind(k.as_str()), Some(k));
        }
        assert!(TemplateKind::from_kind("ClusterRunTemplate").is_none());
        assert_eq!(Lifecycle::default().as_str(), "mutable");
        assert!(Lifecycle::Tekton.is_immutable());
    }
}
