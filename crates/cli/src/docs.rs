//! Loading loom documents from YAML files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use loom_core::model::{BlueprintKind, OwnerKind};
use loom_core::obj;
use serde::Deserialize;
use serde_json::Value;

/// One document and the file it came from.
#[derive(Debug, Clone)]
pub struct Doc {
    pub path: PathBuf,
    pub value: Value,
}

impl Doc {
    pub fn kind(&self) -> &str {
        obj::kind(&self.value).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        obj::name(&self.value).unwrap_or("")
    }

    pub fn describe(&self) -> String {
        match obj::namespace(&self.value) {
            Some(ns) => format!("{}/{}/{}", self.kind(), ns, self.name()),
            None => format!("{}/{}", self.kind(), self.name()),
        }
    }

    pub fn is_owner(&self) -> bool {
        OwnerKind::from_kind(self.kind()).is_some()
    }

    pub fn blueprint_kind(&self) -> Option<BlueprintKind> {
        BlueprintKind::from_kind(self.kind())
    }
}

/// Every non-empty document of a multi-document YAML string.
pub fn parse(text: &str, path: &Path) -> Result<Vec<Doc>> {
    let mut out = Vec::new();
    for (i, de) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = Value::deserialize(de).with_context(|| format!("{}: document {}", path.display(), i + 1))?;
        if value.is_null() {
            continue;
        }
        out.push(Doc { path: path.to_path_buf(), value });
    }
    Ok(out)
}

pub fn load(paths: &[PathBuf]) -> Result<Vec<Doc>> {
    let mut out = Vec::new();
    for p in paths {
        let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        out.extend(parse(&text, p)?);
    }
    Ok(out)
}

/// The owner named `name`, or the only owner when no name is given.
pub fn find_owner<'a>(docs: &'a [Doc], name: Option<&str>) -> Result<&'a Doc> {
    let owners: Vec<&Doc> = docs.iter().filter(|d| d.is_owner()).filter(|d| name.map(|n| d.name() == n).unwrap_or(true)).collect();
    match owners.as_slice() {
        [one] => Ok(one),
        [] => match name {
            Some(n) => anyhow::bail!("no Workload or Deliverable named {}", n),
            None => anyhow::bail!("no Workload or Deliverable in the given files"),
        },
        many => {
            let names: Vec<String> = many.iter().map(|d| d.describe()).collect();
            anyhow::bail!("several owners found, pick one with --owner: {}", names.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = r#"
apiVersion: carto.run/v1alpha1
kind: Workload
metadata:
  name: app
  namespace: dev
  labels: {type: web}
---
# empty documents are skipped
---
apiVersion: carto.run/v1alpha1
kind: ClusterSupplyChain
metadata:
  name: sc
spec:
  selector: {type: web}
"#;

    #[test]
    fn multi_document_files() {
        let docs = parse(TEXT, Path::new("app.yaml")).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].describe(), "Workload/dev/app");
        assert_eq!(docs[1].blueprint_kind(), Some(BlueprintKind::SupplyChain));
        assert_eq!(docs[1].value["spec"]["selector"]["type"], "web");
    }

    #[test]
    fn owner_lookup() {
        let docs = parse(TEXT, Path::new("app.yaml")).unwrap();
        assert_eq!(find_owner(&docs, None).unwrap().name(), "app");
        assert!(find_owner(&docs, Some("other")).is_err());
        let twice: Vec<Doc> = docs.iter().chain(docs.iter()).cloned().collect();
        let err = find_owner(&twice, None).unwrap_err().to_string();
        assert!(err.contains("--owner"), "{}", err);
    }

    #[test]
    fn bad_yaml_names_the_document() {
        let err = parse("a: 1\n---\n[unclosed", Path::new("x.yaml")).unwrap_err();
        assert!(format!("{:#}", err).contains("x.yaml: document 2"));
    }
}
