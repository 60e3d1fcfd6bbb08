//! Uniform runtime view over the five template kinds and the run template.

use std::collections::BTreeMap;

use loom_core::model::{
    from_doc, HealthRule, Lifecycle, ObservedCompletion, ObservedMatch, RetentionPolicy, RunTemplate, Template,
    TemplateKind, TemplateParam, RUN_TEMPLATE_KIND,
};
use loom_core::validate::{validate_run_template, validate_template};
use loom_core::{obj, LoomError};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Cluster(TemplateKind),
    Run,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Cluster(k) => k.as_str(),
            Variant::Run => RUN_TEMPLATE_KIND,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateBody {
    Raw(Value),
    Ytt(String),
}

/// What a deployment template waits for before passing its deployment input on.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Completion(ObservedCompletion),
    Matches(Vec<ObservedMatch>),
}

/// Kind-specific output descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputSpec {
    None,
    Source { url_path: String, revision_path: String },
    Image { image_path: String },
    Config { config_path: String },
    Deployment(Observation),
    /// Run template `outputs`: name to path.
    Named(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTemplate {
    pub variant: Variant,
    pub name: String,
    pub body: TemplateBody,
    pub defaults: Vec<TemplateParam>,
    pub health: Option<HealthRule>,
    pub lifecycle: Lifecycle,
    pub retention: Option<RetentionPolicy>,
    pub outputs: OutputSpec,
}

impl ResolvedTemplate {
    /// Validate and flatten one of the five cluster template kinds.
    pub fn from_template(t: &Template) -> Result<Self, LoomError> {
        validate_template(t)?;
        let kind = t
            .template_kind()
            .ok_or_else(|| LoomError::validation(format!("unknown template kind [{}]", t.kind)))?;
        let s = &t.spec;
        let body = match (&s.template, &s.ytt) {
            (Some(raw), None) => TemplateBody::Raw(raw.clone()),
            (None, Some(ytt)) => TemplateBody::Ytt(ytt.clone()),
            _ => return Err(LoomError::validation("exactly one of template and ytt must be set")),
        };
        let required = |p: &Option<String>, field: &str| {
            p.clone().ok_or_else(|| LoomError::validation(format!("invalid spec: {} is required", field)))
        };
        let outputs = match kind {
            TemplateKind::Plain => OutputSpec::None,
            TemplateKind::Source => OutputSpec::Source {
                url_path: required(&s.url_path, "urlPath")?,
                revision_path: required(&s.revision_path, "revisionPath")?,
            },
            TemplateKind::Image => OutputSpec::Image { image_path: required(&s.image_path, "imagePath")? },
            TemplateKind::Config => OutputSpec::Config { config_path: required(&s.config_path, "configPath")? },
            TemplateKind::Deployment => OutputSpec::Deployment(match &s.observed_completion {
                Some(c) => Observation::Completion(c.clone()),
                None => Observation::Matches(s.observed_matches.clone()),
            }),
        };
        Ok(Self {
            variant: Variant::Cluster(kind),
            name: t.name().to_string(),
            body,
            defaults: s.params.clone(),
            health: s.health_rule.clone(),
            lifecycle: s.lifecycle,
            retention: s.retention_policy.filter(|_| s.lifecycle.is_immutable()),
            outputs,
        })
    }

    /// Run templates are always stamped immutably.
    pub fn from_run_template(t: &RunTemplate) -> Result<Self, LoomError> {
        validate_run_template(t)?;
        Ok(Self {
            variant: Variant::Run,
            name: t.name().to_string(),
            body: TemplateBody::Raw(t.spec.template.clone()),
            defaults: Vec::new(),
            health: None,
            lifecycle: Lifecycle::Immutable,
            retention: None,
            outputs: OutputSpec::Named(t.spec.outputs.clone()),
        })
    }

    /// Dispatch on `kind` of a raw template document.
    pub fn from_doc(doc: &Value) -> Result<Self, LoomError> {
        match obj::kind(doc) {
            Some(RUN_TEMPLATE_KIND) => Self::from_run_template(&from_doc(doc)?),
            Some(k) if TemplateKind::from_kind(k).is_some() => Self::from_template(&from_doc(doc)?),
            other => Err(LoomError::validation(format!("unknown template kind [{}]", other.unwrap_or("")))),
        }
    }

    pub fn template_kind(&self) -> Option<TemplateKind> {
        match self.variant {
            Variant::Cluster(k) => Some(k),
            Variant::Run => None,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        self.variant.as_str()
    }

    pub fn declared_params(&self) -> impl Iterator<Item = &str> {
        self.defaults.iter().map(|p| p.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_template_carries_paths() {
        let t = ResolvedTemplate::from_doc(&json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "ClusterSourceTemplate",
            "metadata": {"name": "git"},
            "spec": {
                "urlPath": "status.url",
                "revisionPath": "status.revision",
                "template": {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}},
                "params": [{"name": "branch", "default": "main"}]
            }
        }))
        .unwrap();
        assert_eq!(t.kind_str(), "ClusterSourceTemplate");
        assert_eq!(
            t.outputs,
            OutputSpec::Source { url_path: "status.url".into(), revision_path: "status.revision".into() }
        );
        assert_eq!(t.declared_params().collect::<Vec<_>>(), vec!["branch"]);
        assert_eq!(t.lifecycle, Lifecycle::Mutable);
    }

    #[test]
    fn run_template_is_immutable_with_named_outputs() {
        let t = ResolvedTemplate::from_doc(&json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "ClusterRunTemplate",
            "metadata": {"name": "tests"},
            "spec": {
                "template": {"apiVersion": "tekton.dev/v1beta1", "kind": "TaskRun", "metadata": {"generateName": "t-"}, "spec": {}},
                "outputs": {"revision": "spec.params[0].value"}
            }
        }))
        .unwrap();
        assert_eq!(t.variant, Variant::Run);
        assert!(t.lifecycle.is_immutable());
        assert!(matches!(t.outputs, OutputSpec::Named(ref m) if m.contains_key("revision")));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let e = ResolvedTemplate::from_doc(&json!({"kind": "Pod"})).unwrap_err();
        assert!(e.message().contains("unknown template kind [Pod]"));
    }
}
