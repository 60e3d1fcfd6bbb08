//! Loom selector engine: label, expression and field predicates, specificity ranking,
//! ambiguity detection and the per-resource template option chooser.

#![forbid(unsafe_code)]

use std::borrow::Cow;

use loom_core::model::{Blueprint, Operator, Requirement, Selector, TemplateOption};
use loom_core::obj::{self, Labels};
use loom_schema::{lookup, normalize_owner_key, PathError};
use serde_json::Value;
use smallvec::SmallVec;
use tracing::trace;

mod options;

pub use options::{choose_option, OptionChoice, OptionError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    /// Field requirement evaluation failed for the candidate at `index`.
    #[error("failed to evaluate selector matchFields: unable to match field requirement with key [{key}] operator [{operator}]: {source}")]
    Field {
        index: usize,
        key: String,
        operator: Operator,
        #[source]
        source: PathError,
    },
}

impl SelectorError {
    pub fn index(&self) -> usize {
        match self {
            SelectorError::Field { index, .. } => *index,
        }
    }
}

/// Anything carrying a selector that can be ranked against an owner.
pub trait Selectable {
    fn selector(&self) -> Cow<'_, Selector>;
}

impl Selectable for Selector {
    fn selector(&self) -> Cow<'_, Selector> {
        Cow::Borrowed(self)
    }
}

impl Selectable for Blueprint {
    fn selector(&self) -> Cow<'_, Selector> {
        Cow::Owned(self.spec.selector())
    }
}

impl Selectable for TemplateOption {
    fn selector(&self) -> Cow<'_, Selector> {
        Cow::Borrowed(&self.selector)
    }
}

/// Outcome of ranking candidates against one owner.
#[derive(Debug)]
pub enum Selection<'a, T> {
    Found(&'a T),
    NotFound,
    Multiple(Vec<&'a T>),
}

fn expression_matches(req: &Requirement, labels: &Labels) -> bool {
    let actual = labels.get(&req.key);
    match req.operator {
        Operator::In => actual.map(|v| req.values.iter().any(|x| x == v)).unwrap_or(false),
        Operator::NotIn => actual.map(|v| !req.values.iter().any(|x| x == v)).unwrap_or(true),
        Operator::Exists => actual.is_some(),
        Operator::DoesNotExist => actual.is_none(),
    }
}

fn render(v: &Value) -> Cow<'_, str> {
    match v {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        other => Cow::Owned(other.to_string()),
    }
}

/// Evaluate one field requirement. A path that does not resolve (or resolves to null) is absent.
pub fn field_matches(req: &Requirement, owner: &Value) -> Result<bool, PathError> {
    let actual = lookup(normalize_owner_key(&req.key), owner)?.filter(|v| !v.is_null());
    Ok(match req.operator {
        Operator::In => actual.map(|v| req.values.iter().any(|x| *x == render(v))).unwrap_or(false),
        Operator::NotIn => actual.map(|v| !req.values.iter().any(|x| *x == render(v))).unwrap_or(true),
        Operator::Exists => actual.is_some(),
        Operator::DoesNotExist => actual.is_none(),
    })
}

/// Specificity score of `selector` against `owner`, or `None` when any clause fails.
pub fn score(selector: &Selector, owner: &Value, index: usize) -> Result<Option<usize>, SelectorError> {
    let labels = obj::labels(owner);
    let labels_ok = selector.match_labels.iter().all(|(k, v)| labels.get(k) == Some(v))
        && selector.match_expressions.iter().all(|r| expression_matches(r, &labels));
    if !labels_ok {
        return Ok(None);
    }
    for req in &selector.match_fields {
        let ok = field_matches(req, owner).map_err(|source| SelectorError::Field {
            index,
            key: req.key.clone(),
            operator: req.operator,
            source,
        })?;
        if !ok {
            return Ok(None);
        }
    }
    Ok(Some(selector.clause_count()))
}

/// Whether every clause of a non-empty selector holds.
pub fn matches(selector: &Selector, owner: &Value) -> Result<bool, SelectorError> {
    Ok(!selector.is_empty() && score(selector, owner, 0)?.is_some())
}

/// Indices of the most specific matching candidates. Empty selectors never match.
pub fn best_match_indices<T: Selectable>(owner: &Value, candidates: &[T]) -> Result<Vec<usize>, SelectorError> {
    let mut best: SmallVec<[usize; 4]> = SmallVec::new();
    let mut high_water = 1usize;
    for (idx, cand) in candidates.iter().enumerate() {
        let sel = cand.selector();
        let Some(s) = score(&sel, owner, idx)? else { continue };
        trace!(index = idx, score = s, "selector matched");
        if s == high_water {
            best.push(idx);
        } else if s > high_water {
            high_water = s;
            best.clear();
            best.push(idx);
        }
    }
    Ok(best.into_vec())
}

/// Pick the single most specific candidate.
pub fn select<'a, T: Selectable>(owner: &Value, candidates: &'a [T]) -> Result<Selection<'a, T>, SelectorError> {
    let idx = best_match_indices(owner, candidates)?;
    Ok(match idx.as_slice() {
        [] => Selection::NotFound,
        [one] => Selection::Found(&candidates[*one]),
        many => Selection::Multiple(many.iter().map(|i| &candidates[*i]).collect()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner() -> Value {
        json!({
            "kind": "Workload",
            "metadata": {"name": "app", "labels": {"type": "web", "tier": "frontend"}},
            "spec": {
                "source": {"git": {"url": "https://x", "ref": {"branch": "main"}}},
                "params": [{"name": "replicas", "value": 3}]
            }
        })
    }

    fn labels(pairs: &[(&str, &str)]) -> Selector {
        Selector { match_labels: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(), ..Default::default() }
    }

    #[test]
    fn most_specific_selector_wins() {
        let cands = vec![labels(&[("type", "web")]), labels(&[("type", "web"), ("tier", "frontend")]), labels(&[("type", "db")])];
        match select(&owner(), &cands).unwrap() {
            Selection::Found(s) => assert_eq!(s.clause_count(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn equal_specificity_is_ambiguous() {
        let mut a = labels(&[("type", "web")]);
        a.match_fields.push(Requirement::new("spec.source.git", Operator::Exists, &[]));
        a.match_fields.push(Requirement::new("spec.source.git.ref.branch", Operator::In, &["main"]));
        let mut b = labels(&[("type", "web")]);
        b.match_fields.push(Requirement::new("workload.spec.source.git", Operator::Exists, &[]));
        b.match_fields.push(Requirement::new("spec.source.git.ref.branch", Operator::In, &["main", "master"]));
        let cands = vec![a, b];
        assert!(matches!(select(&owner(), &cands).unwrap(), Selection::Multiple(v) if v.len() == 2));
    }

    #[test]
    fn empty_selector_never_matches() {
        let cands = vec![Selector::default()];
        assert!(matches!(select(&owner(), &cands).unwrap(), Selection::NotFound));
        assert!(!matches(&Selector::default(), &owner()).unwrap());
    }

    #[test]
    fn expressions_use_label_semantics() {
        let mut s = Selector::default();
        s.match_expressions.push(Requirement::new("tier", Operator::In, &["frontend", "backend"]));
        s.match_expressions.push(Requirement::new("missing", Operator::NotIn, &["x"]));
        s.match_expressions.push(Requirement::new("other", Operator::DoesNotExist, &[]));
        assert!(matches(&s, &owner()).unwrap());
        s.match_expressions.push(Requirement::new("missing", Operator::Exists, &[]));
        assert!(!matches(&s, &owner()).unwrap());
    }

    #[test]
    fn absent_field_paths() {
        let o = owner();
        let req = |op, vals: &[&str]| Requirement::new("spec.image", op, vals);
        assert!(!field_matches(&req(Operator::Exists, &[]), &o).unwrap());
        assert!(field_matches(&req(Operator::DoesNotExist, &[]), &o).unwrap());
        assert!(!field_matches(&req(Operator::In, &["x"]), &o).unwrap());
        assert!(field_matches(&req(Operator::NotIn, &["x"]), &o).unwrap());
    }

    #[test]
    fn non_string_fields_compare_rendered() {
        let r = Requirement::new(r#"spec.params[?(@.name=="replicas")].value"#, Operator::In, &["3"]);
        assert!(field_matches(&r, &owner()).unwrap());
    }

    #[test]
    fn evaluation_errors_carry_index() {
        let mut bad = labels(&[("type", "web")]);
        bad.match_fields.push(Requirement::new("metadata.labels[*]", Operator::Exists, &[]));
        let cands = vec![labels(&[("type", "web")]), bad];
        let e = best_match_indices(&owner(), &cands).unwrap_err();
        assert_eq!(e.index(), 1);
        assert!(e.to_string().contains("too many results"));
    }

    #[test]
    fn label_mismatch_skips_field_evaluation() {
        let mut bad = labels(&[("type", "db")]);
        bad.match_fields.push(Requirement::new("metadata.labels[*]", Operator::Exists, &[]));
        assert!(best_match_indices(&owner(), &[bad]).unwrap().is_empty());
    }
}
