use loom_core::model::{Lifecycle, OwnerReference};
use loom_core::obj::{self, Labels};
use serde_json::Value;
use tracing::trace;

use crate::interpolate::interpolate;
use crate::model::TemplateBody;
use crate::ytt::Preprocessor;
use crate::StampError;

/// Turns template bodies into concrete documents owned by one owner.
#[derive(Debug, Clone)]
pub struct Stamper<'a> {
    owner: &'a Value,
    labels: Labels,
    lifecycle: Lifecycle,
    name_prefix: String,
}

impl<'a> Stamper<'a> {
    /// `name_prefix` seeds `generateName` for immutable bodies that carry no name.
    pub fn new(owner: &'a Value, labels: Labels, lifecycle: Lifecycle, name_prefix: impl Into<String>) -> Self {
        Self { owner, labels, lifecycle, name_prefix: name_prefix.into() }
    }

    /// Stamp a raw or `ytt` body against `ctx`.
    pub async fn stamp(&self, body: &TemplateBody, ctx: &Value, ytt: &dyn Preprocessor) -> Result<Value, StampError> {
        let doc = match body {
            TemplateBody::Raw(raw) => interpolate(raw, ctx)?,
            TemplateBody::Ytt(text) => ytt.render(text, ctx).await?,
        };
        self.finish(doc)
    }

    /// Stamp a raw body; no preprocessor involved.
    pub fn stamp_raw(&self, raw: &Value, ctx: &Value) -> Result<Value, StampError> {
        self.finish(interpolate(raw, ctx)?)
    }

    fn finish(&self, mut doc: Value) -> Result<Value, StampError> {
        if !doc.is_object() {
            return Err(StampError::NotAnObject);
        }
        let owner_ns = obj::namespace(self.owner).unwrap_or("");
        if let Some(ns) = obj::namespace(&doc) {
            if ns != owner_ns {
                return Err(StampError::Namespace);
            }
        }
        let owner_ref = self.owner_reference();
        let name = obj::name(&doc).filter(|n| !n.is_empty()).map(str::to_string);
        let immutable = self.lifecycle.is_immutable();
        if !immutable && name.is_none() {
            return Err(StampError::Unnamed);
        }
        let meta = obj::meta_mut(&mut doc).ok_or(StampError::NotAnObject)?;
        if !owner_ns.is_empty() {
            meta.insert("namespace".into(), Value::String(owner_ns.to_string()));
        }
        meta.insert("ownerReferences".into(), Value::Array(vec![owner_ref]));
        if immutable {
            meta.remove("name");
            let has_generate = meta.get("generateName").and_then(|g| g.as_str()).map(|g| !g.is_empty()).unwrap_or(false);
            match name {
                Some(n) => {
                    meta.insert("generateName".into(), Value::String(format!("{}-", n)));
                }
                None if !has_generate => {
                    meta.insert("generateName".into(), Value::String(format!("{}-", self.name_prefix)));
                }
                None => {}
            }
        }
        obj::merge_labels(&mut doc, &self.labels);
        trace!(kind = obj::kind(&doc).unwrap_or(""), immutable, "stamped");
        Ok(doc)
    }

    fn owner_reference(&self) -> Value {
        let r = OwnerReference {
            api_version: obj::api_version(self.owner).unwrap_or("").to_string(),
            kind: obj::kind(self.owner).unwrap_or("").to_string(),
            name: obj::name(self.owner).unwrap_or("").to_string(),
            uid: obj::uid(self.owner).unwrap_or("").to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        serde_json::to_value(r).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait::async_trait]
    impl Preprocessor for Echo {
        async fn render(&self, template: &str, ctx: &Value) -> Result<Value, StampError> {
            Ok(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": template},
                "data": {"owner": ctx["workload"]["metadata"]["name"]}
            }))
        }
    }

    fn owner() -> Value {
        json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "Workload",
            "metadata": {"name": "app", "namespace": "dev", "uid": "u-1"}
        })
    }

    fn labels() -> Labels {
        [("carto.run/workload-name".to_string(), "app".to_string())].into_iter().collect()
    }

    fn ctx() -> Value {
        json!({"workload": owner(), "params": {"v": "bar"}})
    }

    #[test]
    fn mutable_stamp_sets_namespace_labels_and_owner() {
        let o = owner();
        let s = Stamper::new(&o, labels(), Lifecycle::Mutable, "app-cm");
        let body = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm", "labels": {"mine": "x"}}, "data": {"foo": "$(params.v)$"}});
        let out = s.stamp_raw(&body, &ctx()).unwrap();
        assert_eq!(out["metadata"]["name"], "cm");
        assert_eq!(out["metadata"]["namespace"], "dev");
        assert_eq!(out["metadata"]["labels"]["mine"], "x");
        assert_eq!(out["metadata"]["labels"]["carto.run/workload-name"], "app");
        assert_eq!(out["data"]["foo"], "bar");
        let refs = out["metadata"]["ownerReferences"].as_array().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0]["uid"], "u-1");
        assert_eq!(refs[0]["controller"], true);
        assert_eq!(refs[0]["blockOwnerDeletion"], true);
    }

    #[test]
    fn stamping_is_deterministic() {
        let o = owner();
        let s = Stamper::new(&o, labels(), Lifecycle::Mutable, "p");
        let body = json!({"kind": "ConfigMap", "metadata": {"name": "cm"}, "data": {"foo": "$(params.v)$"}});
        assert_eq!(s.stamp_raw(&body, &ctx()).unwrap(), s.stamp_raw(&body, &ctx()).unwrap());
    }

    #[test]
    fn immutable_uses_generate_name() {
        let o = owner();
        let s = Stamper::new(&o, labels(), Lifecycle::Immutable, "app-build");
        let named = s.stamp_raw(&json!({"kind": "TaskRun", "metadata": {"name": "run"}}), &ctx()).unwrap();
        assert!(named["metadata"].get("name").is_none());
        assert_eq!(named["metadata"]["generateName"], "run-");
        let anon = s.stamp_raw(&json!({"kind": "TaskRun", "metadata": {}}), &ctx()).unwrap();
        assert_eq!(anon["metadata"]["generateName"], "app-build-");
        let kept = s.stamp_raw(&json!({"kind": "TaskRun", "metadata": {"generateName": "mine-"}}), &ctx()).unwrap();
        assert_eq!(kept["metadata"]["generateName"], "mine-");
    }

    #[test]
    fn foreign_namespace_is_rejected() {
        let o = owner();
        let s = Stamper::new(&o, labels(), Lifecycle::Mutable, "p");
        let e = s.stamp_raw(&json!({"kind": "X", "metadata": {"name": "x", "namespace": "other"}}), &ctx()).unwrap_err();
        assert_eq!(e, StampError::Namespace);
        let same = s.stamp_raw(&json!({"kind": "X", "metadata": {"name": "x", "namespace": "dev"}}), &ctx());
        assert!(same.is_ok());
    }

    #[test]
    fn mutable_without_name_fails() {
        let o = owner();
        let s = Stamper::new(&o, labels(), Lifecycle::Mutable, "p");
        assert_eq!(s.stamp_raw(&json!({"kind": "X"}), &ctx()).unwrap_err(), StampError::Unnamed);
        assert_eq!(s.stamp_raw(&json!("x"), &ctx()).unwrap_err(), StampError::NotAnObject);
    }

    #[tokio::test]
    async fn ytt_bodies_go_through_the_preprocessor() {
        let o = owner();
        let s = Stamper::new(&o, labels(), Lifecycle::Mutable, "p");
        let out = s.stamp(&TemplateBody::Ytt("from-ytt".into()), &ctx(), &Echo).await.unwrap();
        assert_eq!(out["metadata"]["name"], "from-ytt");
        assert_eq!(out["data"]["owner"], "app");
        assert_eq!(out["metadata"]["namespace"], "dev");
    }
}
