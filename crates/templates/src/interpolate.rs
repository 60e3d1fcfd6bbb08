//! `$(expr)$` tag interpolation over JSON trees.

use std::fmt::Write as _;

use loom_schema::lookup;
use serde_json::{Map, Value};

use crate::StampError;

const OPEN: &str = "$(";
const CLOSE: &str = ")$";

enum Step<'a> {
    Key(&'a str),
    Index(usize),
}

#[derive(Default)]
struct Trail<'a>(Vec<Step<'a>>);

impl Trail<'_> {
    fn render(&self) -> String {
        let mut out = String::new();
        for step in &self.0 {
            match step {
                Step::Key(k) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(k);
                }
                Step::Index(i) => {
                    let _ = write!(out, "[{}]", i);
                }
            }
        }
        out
    }
}

enum LeafError {
    Missing(String),
    Other(String),
}

impl LeafError {
    fn at(self, path: String) -> StampError {
        match self {
            LeafError::Missing(expr) => StampError::MissingValue { path, expr },
            LeafError::Other(reason) => StampError::Interpolate { path, reason },
        }
    }
}

fn is_single_tag(s: &str) -> bool {
    s.starts_with(OPEN) && s.ends_with(CLOSE) && s.matches(OPEN).count() == 1
}

fn evaluate<'c>(expr: &str, ctx: &'c Value) -> Result<&'c Value, LeafError> {
    match lookup(expr, ctx) {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Err(LeafError::Missing(expr.to_string())),
        Err(e) => Err(LeafError::Other(format!("evaluate jsonpath: {}", e))),
    }
}

fn interpolate_leaf(s: &str, ctx: &Value) -> Result<Value, LeafError> {
    if is_single_tag(s) {
        let expr = &s[OPEN.len()..s.len() - CLOSE.len()];
        return evaluate(expr, ctx).cloned();
    }
    if !s.contains(OPEN) {
        return Ok(Value::String(s.to_string()));
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| LeafError::Other(format!("cannot find end tag \"{}\" in [{}]", CLOSE, s)))?;
        let expr = &after[..end];
        match evaluate(expr, ctx)? {
            Value::Null => return Err(LeafError::Other(format!("tag must not point to nil value: {}", expr))),
            Value::String(v) => out.push_str(v),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn walk<'t>(v: &'t Value, ctx: &Value, trail: &mut Trail<'t>) -> Result<Value, StampError> {
    match v {
        Value::String(s) => interpolate_leaf(s, ctx).map_err(|e| e.at(trail.render())),
        Value::Object(m) => {
            let mut out = Map::with_capacity(m.len());
            for (k, child) in m {
                trail.0.push(Step::Key(k));
                let stamped = walk(child, ctx, trail)?;
                trail.0.pop();
                out.insert(k.clone(), stamped);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, child) in items.iter().enumerate() {
                trail.0.push(Step::Index(i));
                out.push(walk(child, ctx, trail)?);
                trail.0.pop();
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

/// Replace every tag in every string leaf of `tree`, evaluated against `ctx`.
///
/// A leaf that is exactly one tag becomes the typed value it points at. Otherwise each tag
/// is substituted inline: strings verbatim, other values JSON-encoded, null rejected.
pub fn interpolate(tree: &Value, ctx: &Value) -> Result<Value, StampError> {
    walk(tree, ctx, &mut Trail::default())
}
