//! Typed outputs read off live stamped objects, and their status rendering.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use loom_core::model::{InputKind, OutputStatus};
use loom_core::obj;
use loom_schema::lookup;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::model::{OutputSpec, ResolvedTemplate};
use crate::OutputError;

pub const PREVIEW_LIMIT: usize = 1024;

/// Output of one realized resource, shaped by the kind of template that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Source { url: Value, revision: Value },
    Image(Value),
    Config(Value),
    Deployment { url: Value, revision: Value },
}

impl Output {
    pub fn kind(&self) -> InputKind {
        match self {
            Output::Source { .. } => InputKind::Source,
            Output::Image(_) => InputKind::Image,
            Output::Config(_) => InputKind::Config,
            Output::Deployment { .. } => InputKind::Deployment,
        }
    }

    /// Named fields as listed on a resource status.
    pub fn fields(&self) -> Vec<(&'static str, &Value)> {
        match self {
            Output::Source { url, revision } | Output::Deployment { url, revision } => {
                vec![("url", url), ("revision", revision)]
            }
            Output::Image(image) => vec![("image", image)],
            Output::Config(config) => vec![("config", config)],
        }
    }

    /// Value bound under `sources.<name>`, `images.<name>` or `configs.<name>`.
    pub fn input_value(&self, name: &str) -> Value {
        let mut v = self.singleton_object();
        if let Some(m) = v.as_object_mut() {
            m.insert("name".into(), Value::String(name.to_string()));
        }
        v
    }

    /// Value bound to the singular context key. Images and configs bind the bare value.
    pub fn singleton_value(&self) -> Value {
        match self {
            Output::Image(image) => image.clone(),
            Output::Config(config) => config.clone(),
            _ => self.singleton_object(),
        }
    }

    fn singleton_object(&self) -> Value {
        match self {
            Output::Source { url, revision } | Output::Deployment { url, revision } => {
                json!({"url": url, "revision": revision})
            }
            Output::Image(image) => json!({"image": image}),
            Output::Config(config) => json!({"config": config}),
        }
    }
}

fn describe(stamped: &Value) -> String {
    format!("{}/{}", obj::kind(stamped).unwrap_or(""), obj::name(stamped).unwrap_or(""))
}

fn read(field: &str, path: &str, stamped: &Value) -> Result<Value, OutputError> {
    match lookup(path, stamped) {
        Ok(Some(v)) if !v.is_null() => Ok(v.clone()),
        Ok(_) => Err(OutputError::Missing { path: path.to_string(), resource: describe(stamped) }),
        Err(source) => Err(OutputError::Evaluate { field: field.to_string(), path: path.to_string(), source }),
    }
}

/// Read the typed output of `template` off `stamped`. Plain templates produce none; deployment
/// templates forward their deployment input and must only be asked once observation holds.
pub fn extract_output(
    template: &ResolvedTemplate,
    stamped: &Value,
    deployment: Option<&Output>,
) -> Result<Option<Output>, OutputError> {
    Ok(match &template.outputs {
        OutputSpec::None | OutputSpec::Named(_) => None,
        OutputSpec::Source { url_path, revision_path } => Some(Output::Source {
            url: read("urlPath", url_path, stamped)?,
            revision: read("revisionPath", revision_path, stamped)?,
        }),
        OutputSpec::Image { image_path } => Some(Output::Image(read("imagePath", image_path, stamped)?)),
        OutputSpec::Config { config_path } => Some(Output::Config(read("configPath", config_path, stamped)?)),
        OutputSpec::Deployment(_) => match deployment {
            Some(Output::Source { url, revision }) | Some(Output::Deployment { url, revision }) => {
                Some(Output::Deployment { url: url.clone(), revision: revision.clone() })
            }
            _ => return Err(OutputError::NoDeployment),
        },
    })
}

/// Evaluate run template `outputs` against one run.
pub fn named_outputs(paths: &BTreeMap<String, String>, run: &Value) -> Result<BTreeMap<String, Value>, OutputError> {
    paths.iter().map(|(name, path)| Ok((name.clone(), read(name, path, run)?))).collect()
}

fn truncate(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// `(preview, digest)` of one output value.
pub fn preview_and_digest(value: &Value) -> Result<(String, String), serde_yaml::Error> {
    let yaml = serde_yaml::to_string(value)?;
    let digest = format!("sha256:{}", hex::encode(Sha256::digest(yaml.as_bytes())));
    Ok((truncate(&yaml, PREVIEW_LIMIT).to_string(), digest))
}

/// Status entries for `output`. An entry whose digest did not change keeps its previous
/// `lastTransitionTime`.
pub fn output_statuses(output: &Output, prev: &[OutputStatus], now: DateTime<Utc>) -> Result<Vec<OutputStatus>, OutputError> {
    output
        .fields()
        .into_iter()
        .map(|(name, value)| {
            let (preview, digest) = preview_and_digest(value)
                .map_err(|e| OutputError::Render { name: name.to_string(), reason: e.to_string() })?;
            let ltt = prev
                .iter()
                .find(|p| p.name == name && p.digest == digest)
                .and_then(|p| p.last_transition_time)
                .unwrap_or(now);
            Ok(OutputStatus { name: name.to_string(), preview, digest, last_transition_time: Some(ltt) })
        })
        .collect()
}
