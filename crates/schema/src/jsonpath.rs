use std::fmt;

use serde_json::Value;
use smallvec::{smallvec, SmallVec};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("empty jsonpath not allowed")]
    Empty,
    #[error("invalid jsonpath [{path}]: {reason}")]
    Parse { path: String, reason: String },
    #[error("jsonpath returned empty list: {0}")]
    NotFound(String),
    #[error("too many results for the query: {0}")]
    TooManyResults(String),
}

impl PathError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PathError::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Exists,
}

/// `[?(@.path == literal)]` predicate over array elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub path: Vec<Segment>,
    pub op: FilterOp,
    pub literal: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Field(String),
    Index(i64),
    Wildcard,
    Filter(Filter),
}

/// A parsed path. Accepts `{.a.b}`, `.a.b`, `a.b`, `$.a`, `[n]`, `['k']`, `[*]` and filters.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    source: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn parse(expr: &str) -> Result<Self, PathError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }
        let inner = unwrap_wrapper(trimmed);
        let mut p = Parser { src: expr, chars: inner.chars().collect(), pos: 0 };
        let segments = p.segments(false)?;
        if p.pos != p.chars.len() {
            return Err(p.err("unexpected trailing characters"));
        }
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(Self { source: expr.to_string(), segments })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// All values the path selects, in document order.
    pub fn query<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        walk(&self.segments, root).into_vec()
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.segments {
            write!(f, "{}", seg)?;
        }
        Ok(())
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Field(k) if k.contains('.') || k.contains('[') => write!(f, "['{}']", k),
            Segment::Field(k) => write!(f, ".{}", k),
            Segment::Index(i) => write!(f, "[{}]", i),
            Segment::Wildcard => write!(f, "[*]"),
            Segment::Filter(flt) => {
                write!(f, "[?(@")?;
                for s in &flt.path {
                    write!(f, "{}", s)?;
                }
                match flt.op {
                    FilterOp::Exists => write!(f, ")]"),
                    FilterOp::Eq => write!(f, "=={})]", flt.literal),
                    FilterOp::Ne => write!(f, "!={})]", flt.literal),
                }
            }
        }
    }
}

/// Evaluate `expr` and require exactly one result.
pub fn eval_single(expr: &str, root: &Value) -> Result<Value, PathError> {
    match lookup(expr, root)? {
        Some(v) => Ok(v.clone()),
        None => Err(PathError::NotFound(expr.to_string())),
    }
}

/// Evaluate `expr`; `Ok(None)` when nothing matches, an error when more than one value does.
pub fn lookup<'a>(expr: &str, root: &'a Value) -> Result<Option<&'a Value>, PathError> {
    let path = JsonPath::parse(expr)?;
    let mut hits = path.query(root);
    match hits.len() {
        0 => Ok(None),
        1 => Ok(hits.pop()),
        _ => Err(PathError::TooManyResults(expr.to_string())),
    }
}

fn unwrap_wrapper(s: &str) -> &str {
    let s = match s.strip_prefix('{') {
        Some(rest) => rest.strip_suffix('}').unwrap_or(rest),
        None => s,
    };
    s.strip_prefix('$').unwrap_or(s)
}

fn walk<'a>(segments: &[Segment], root: &'a Value) -> SmallVec<[&'a Value; 4]> {
    let mut cur: SmallVec<[&'a Value; 4]> = smallvec![root];
    for seg in segments {
        let mut next: SmallVec<[&'a Value; 4]> = SmallVec::new();
        for v in cur {
            step(seg, v, &mut next);
        }
        if next.is_empty() {
            return next;
        }
        cur = next;
    }
    cur
}

fn step<'a>(seg: &Segment, v: &'a Value, out: &mut SmallVec<[&'a Value; 4]>) {
    match seg {
        Segment::Field(k) => {
            if let Value::Object(map) = v {
                if let Some(x) = map.get(k) {
                    out.push(x);
                }
            }
        }
        Segment::Index(i) => {
            if let Value::Array(arr) = v {
                let idx = if *i < 0 { arr.len() as i64 + *i } else { *i };
                if idx >= 0 {
                    if let Some(x) = arr.get(idx as usize) {
                        out.push(x);
                    }
                }
            }
        }
        Segment::Wildcard => match v {
            Value::Array(arr) => out.extend(arr.iter()),
            Value::Object(map) => out.extend(map.values()),
            _ => {}
        },
        Segment::Filter(flt) => {
            if let Value::Array(arr) = v {
                for item in arr {
                    if flt.matches(item) {
                        out.push(item);
                    }
                }
            }
        }
    }
}

impl Filter {
    fn matches(&self, item: &Value) -> bool {
        let hits = walk(&self.path, item);
        match self.op {
            FilterOp::Exists => hits.iter().any(|v| !v.is_null()),
            FilterOp::Eq => hits.iter().any(|v| loosely_equal(v, &self.literal)),
            FilterOp::Ne => !hits.is_empty() && !hits.iter().any(|v| loosely_equal(v, &self.literal)),
        }
    }
}

// Condition statuses and similar fields are often compared against quoted literals.
fn loosely_equal(actual: &Value, literal: &Value) -> bool {
    if actual == literal {
        return true;
    }
    match (actual, literal) {
        (Value::Number(n), Value::String(s)) => n.to_string() == *s,
        (Value::Bool(b), Value::String(s)) => b.to_string() == *s,
        _ => false,
    }
}

struct Parser<'a> {
    src: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, reason: &str) -> PathError {
        PathError::Parse { path: self.src.to_string(), reason: format!("{} at offset {}", reason, self.pos) }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> Result<(), PathError> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            _ => Err(self.err(&format!("expected '{}'", want))),
        }
    }

    fn is_terminator(c: char, in_filter: bool) -> bool {
        in_filter && (c.is_whitespace() || c == '=' || c == '!' || c == ')')
    }

    fn segments(&mut self, in_filter: bool) -> Result<Vec<Segment>, PathError> {
        let mut out = Vec::new();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if Self::is_terminator(c, in_filter) {
                break;
            }
            match c {
                '.' => {
                    self.bump();
                    if self.peek() == Some('[') {
                        continue;
                    }
                    let ident = self.ident(in_filter);
                    if ident.is_empty() {
                        return Err(self.err("empty field name"));
                    }
                    out.push(field_or_wildcard(ident));
                }
                '[' => {
                    self.bump();
                    out.push(self.bracket()?);
                }
                _ if self.pos == start => {
                    let ident = self.ident(in_filter);
                    out.push(field_or_wildcard(ident));
                }
                _ => return Err(self.err("unexpected character")),
            }
        }
        Ok(out)
    }

    fn ident(&mut self, in_filter: bool) -> String {
        let mut s = String::new();
        while let Some(c) = self.peek() {
            if c == '.' || c == '[' || Self::is_terminator(c, in_filter) {
                break;
            }
            s.push(c);
            self.pos += 1;
        }
        s
    }

    fn bracket(&mut self) -> Result<Segment, PathError> {
        self.skip_ws();
        let seg = match self.peek() {
            Some('?') => {
                self.bump();
                self.expect('(')?;
                self.skip_ws();
                self.expect('@')?;
                let path = self.segments(true)?;
                self.skip_ws();
                let (op, literal) = match self.peek() {
                    Some(')') => (FilterOp::Exists, Value::Null),
                    Some('=') => {
                        self.bump();
                        self.expect('=')?;
                        self.skip_ws();
                        (FilterOp::Eq, self.literal()?)
                    }
                    Some('!') => {
                        self.bump();
                        self.expect('=')?;
                        self.skip_ws();
                        (FilterOp::Ne, self.literal()?)
                    }
                    _ => return Err(self.err("expected comparison in filter")),
                };
                self.skip_ws();
                self.expect(')')?;
                Segment::Filter(Filter { path, op, literal })
            }
            Some(q @ ('\'' | '"')) => {
                self.bump();
                Segment::Field(self.quoted(q)?)
            }
            Some('*') => {
                self.bump();
                Segment::Wildcard
            }
            Some(c) if c == '-' || c.is_ascii_digit() => {
                let mut s = String::new();
                while let Some(c) = self.peek() {
                    if c == '-' || c.is_ascii_digit() {
                        s.push(c);
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                let idx = s.parse::<i64>().map_err(|_| self.err("invalid array index"))?;
                Segment::Index(idx)
            }
            _ => return Err(self.err("invalid bracket expression")),
        };
        self.skip_ws();
        self.expect(']')?;
        Ok(seg)
    }

    fn quoted(&mut self, q: char) -> Result<String, PathError> {
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated string")),
                Some('\\') => match self.bump() {
                    Some(c) => s.push(c),
                    None => return Err(self.err("unterminated escape")),
                },
                Some(c) if c == q => return Ok(s),
                Some(c) => s.push(c),
            }
        }
    }

    fn literal(&mut self) -> Result<Value, PathError> {
        match self.peek() {
            Some(q @ ('\'' | '"')) => {
                self.bump();
                Ok(Value::String(self.quoted(q)?))
            }
            Some(_) => {
                let mut tok = String::new();
                while let Some(c) = self.peek() {
                    if c.is_whitespace() || c == ')' {
                        break;
                    }
                    tok.push(c);
                    self.pos += 1;
                }
                serde_json::from_str::<Value>(&tok).map_err(|_| self.err("invalid filter literal"))
            }
            None => Err(self.err("missing filter literal")),
        }
    }
}

fn field_or_wildcard(ident: String) -> Segment {
    if ident == "*" {
        Segment::Wildcard
    } else {
        Segment::Field(ident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "spec": { "source": { "git": { "url": "https://x", "ref": { "branch": "main" } } }, "replicas": 3 },
            "metadata": { "labels": { "app.kubernetes.io/name": "web" } },
            "status": {
                "conditions": [
                    { "type": "Ready", "status": "True", "message": "ok" },
                    { "type": "Succeeded", "status": "False" }
                ],
                "observedGeneration": 2
            }
        })
    }

    #[test]
    fn parses_common_forms_to_the_same_path() {
        let a = JsonPath::parse("spec.source.git.url").unwrap();
        let b = JsonPath::parse(".spec.source.git.url").unwrap();
        let c = JsonPath::parse("{.spec.source.git.url}").unwrap();
        let d = JsonPath::parse("$.spec['source'].git.url").unwrap();
        assert_eq!(a.segments(), b.segments());
        assert_eq!(a.segments(), c.segments());
        assert_eq!(a.segments(), d.segments());
        assert_eq!(a.to_string(), ".spec.source.git.url");
    }

    #[test]
    fn filter_selects_matching_elements() {
        let v = doc();
        let got = eval_single(r#"status.conditions[?(@.type=="Ready")].status"#, &v).unwrap();
        assert_eq!(got, json!("True"));
        let got = eval_single(r#"{.status.conditions[?(@.type == 'Succeeded')]}"#, &v).unwrap();
        assert_eq!(got["status"], json!("False"));
    }

    #[test]
    fn quoted_keys_with_dots() {
        let v = doc();
        let got = eval_single("metadata.labels['app.kubernetes.io/name']", &v).unwrap();
        assert_eq!(got, json!("web"));
    }

    #[test]
    fn wildcard_and_indexes() {
        let v = doc();
        let p = JsonPath::parse("status.conditions[*].type").unwrap();
        assert_eq!(p.query(&v).len(), 2);
        assert_eq!(eval_single("status.conditions[-1].type", &v).unwrap(), json!("Succeeded"));
        assert_eq!(eval_single("status.conditions[0].message", &v).unwrap(), json!("ok"));
    }

    #[test]
    fn single_result_rules() {
        let v = doc();
        let e = eval_single("status.conditions[*].type", &v).unwrap_err();
        assert!(matches!(e, PathError::TooManyResults(_)));
        let e = eval_single("spec.nope", &v).unwrap_err();
        assert!(e.is_not_found());
        assert_eq!(lookup("spec.nope", &v).unwrap(), None);
        assert_eq!(eval_single("spec.replicas", &v).unwrap(), json!(3));
    }

    #[test]
    fn numeric_literals_compare_loosely() {
        let v = json!({ "items": [ { "n": 1, "v": "a" }, { "n": 2, "v": "b" } ] });
        assert_eq!(eval_single("items[?(@.n==2)].v", &v).unwrap(), json!("b"));
        assert_eq!(eval_single("items[?(@.n=='1')].v", &v).unwrap(), json!("a"));
        assert_eq!(eval_single("items[?(@.n!=1)].v", &v).unwrap(), json!("b"));
    }

    #[test]
    fn parse_errors_are_reported() {
        assert_eq!(JsonPath::parse("").unwrap_err(), PathError::Empty);
        assert!(matches!(JsonPath::parse("spec[").unwrap_err(), PathError::Parse { .. }));
        assert!(matches!(JsonPath::parse("spec[?(@.a=)]").unwrap_err(), PathError::Parse { .. }));
        assert!(matches!(JsonPath::parse("spec..x").unwrap_err(), PathError::Parse { .. }));
        assert!(matches!(JsonPath::parse("spec['x").unwrap_err(), PathError::Parse { .. }));
    }
}
