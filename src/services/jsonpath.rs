//! Kubernetes-style JSONPath templates (`{.items[*].metadata.name}`)
//!
//! Only the `{...}` expression blocks produce results; literal text between
//! blocks is ignored by [`JsonPath::find_results`].

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JsonPathError {
    #[error("unclosed action in '{0}'")]
    Unclosed(String),

    #[error("unrecognized character in action: {0}")]
    Syntax(String),

    #[error("{0} is not found")]
    NotFound(String),

    #[error("array index out of bounds: index {index}, length {length}")]
    OutOfBounds { index: i64, length: usize },

    #[error("unsupported JSONPath construct: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Field(String),
    Wildcard,
    Recursive(String),
    Index(i64),
    Slice(Option<i64>, Option<i64>),
    Union(Vec<i64>),
    Filter(Filter),
}

#[derive(Debug, Clone, PartialEq)]
struct Filter {
    path: Vec<Step>,
    comparison: Option<(CompareOp, Value)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed JSONPath template
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    expressions: Vec<Vec<Step>>,
}

impl JsonPath {
    /// Parses a template containing one or more `{...}` blocks
    pub fn parse(text: &str) -> Result<Self, JsonPathError> {
        let mut expressions = Vec::new();
        let mut rest = text;
        while let Some(open) = rest.find('{') {
            let after = &rest[open + 1..];
            let close = find_close(after).ok_or_else(|| JsonPathError::Unclosed(text.to_string()))?;
            let body = after[..close].trim();
            if body == "end" || body.starts_with("range ") {
                return Err(JsonPathError::Unsupported(body.to_string()));
            }
            expressions.push(parse_path(body)?);
            rest = &after[close + 1..];
        }
        Ok(Self { expressions })
    }

    /// Number of `{...}` expressions in the template
    pub fn expression_count(&self) -> usize {
        self.expressions.len()
    }

    /// Evaluates every expression, returning one result list per expression
    pub fn find_results(&self, data: &Value) -> Result<Vec<Vec<Value>>, JsonPathError> {
        self.expressions
            .iter()
            .map(|steps| evaluate(steps, data))
            .collect()
    }
}

/// Finds the `}` closing the current block, skipping quoted strings
fn find_close(text: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '{') => depth += 1,
            (None, '}') if depth == 0 => return Some(i),
            (None, '}') => depth -= 1,
            _ => {}
        }
    }
    None
}

fn parse_path(body: &str) -> Result<Vec<Step>, JsonPathError> {
    let syntax = || JsonPathError::Syntax(body.to_string());
    let chars: Vec<char> = body.chars().collect();
    let mut steps = Vec::new();
    let mut i = 0;

    if matches!(chars.first(), Some('$' | '@')) {
        i = 1;
    }

    while i < chars.len() {
        match chars[i] {
            '.' if chars.get(i + 1) == Some(&'.') => {
                i += 2;
                let name = take_identifier(&chars, &mut i);
                if name.is_empty() {
                    return Err(syntax());
                }
                steps.push(Step::Recursive(name));
            }
            '.' => {
                i += 1;
                if chars.get(i) == Some(&'*') {
                    i += 1;
                    steps.push(Step::Wildcard);
                    continue;
                }
                let name = take_identifier(&chars, &mut i);
                if !name.is_empty() {
                    steps.push(Step::Field(name));
                }
            }
            '[' => {
                let close = matching_bracket(&chars, i).ok_or_else(syntax)?;
                let inner: String = chars[i + 1..close].iter().collect();
                steps.push(parse_bracket(inner.trim()).ok_or_else(syntax)?);
                i = close + 1;
            }
            c if c.is_whitespace() => i += 1,
            _ => return Err(syntax()),
        }
    }
    Ok(steps)
}

fn take_identifier(chars: &[char], i: &mut usize) -> String {
    let start = *i;
    while *i < chars.len() && (chars[*i].is_alphanumeric() || matches!(chars[*i], '_' | '-' | '/')) {
        *i += 1;
    }
    chars[start..*i].iter().collect()
}

fn matching_bracket(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (offset, &c) in chars[open..].iter().enumerate() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_bracket(inner: &str) -> Option<Step> {
    if inner == "*" {
        return Some(Step::Wildcard);
    }
    if let Some(filter) = inner.strip_prefix("?(").and_then(|f| f.strip_suffix(')')) {
        return parse_filter(filter.trim()).map(Step::Filter);
    }
    if let Some(name) = unquote(inner) {
        return Some(Step::Field(name));
    }
    if let Some((start, end)) = inner.split_once(':') {
        let bound = |s: &str| -> Option<Option<i64>> {
            let s = s.trim();
            if s.is_empty() {
                Some(None)
            } else {
                s.parse().ok().map(Some)
            }
        };
        // a step component is accepted but only a step of one is supported
        let end = end.split(':').next().unwrap_or_default();
        return Some(Step::Slice(bound(start)?, bound(end)?));
    }
    if inner.contains(',') {
        let indices: Option<Vec<i64>> = inner.split(',').map(|s| s.trim().parse().ok()).collect();
        return indices.map(Step::Union);
    }
    inner.parse().ok().map(Step::Index)
}

fn unquote(s: &str) -> Option<String> {
    let s = s.trim();
    for q in ['\'', '"'] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return Some(s[1..s.len() - 1].to_string());
        }
    }
    None
}

fn parse_filter(text: &str) -> Option<Filter> {
    let ops = [
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        ("<=", CompareOp::Le),
        (">=", CompareOp::Ge),
        ("<", CompareOp::Lt),
        (">", CompareOp::Gt),
    ];
    for (token, op) in ops {
        if let Some((lhs, rhs)) = text.split_once(token) {
            let path = parse_path(lhs.trim()).ok()?;
            let rhs = rhs.trim();
            let literal = unquote(rhs).map(Value::String).or_else(|| serde_json::from_str(rhs).ok())?;
            return Some(Filter {
                path,
                comparison: Some((op, literal)),
            });
        }
    }
    Some(Filter {
        path: parse_path(text).ok()?,
        comparison: None,
    })
}

fn evaluate(steps: &[Step], data: &Value) -> Result<Vec<Value>, JsonPathError> {
    let mut current = vec![data.clone()];
    for step in steps {
        current = apply_step(step, current)?;
    }
    Ok(current)
}

fn apply_step(step: &Step, input: Vec<Value>) -> Result<Vec<Value>, JsonPathError> {
    let mut out = Vec::new();
    match step {
        Step::Field(name) => {
            for v in &input {
                if let Some(found) = v.get(name) {
                    out.push(found.clone());
                }
            }
            if out.is_empty() && !input.is_empty() {
                return Err(JsonPathError::NotFound(name.clone()));
            }
        }
        Step::Wildcard => {
            for v in input {
                match v {
                    Value::Array(items) => out.extend(items),
                    Value::Object(map) => out.extend(map.into_iter().map(|(_, v)| v)),
                    _ => {}
                }
            }
        }
        Step::Recursive(name) => {
            for v in &input {
                collect_recursive(v, name, &mut out);
            }
        }
        Step::Index(index) => {
            for v in &input {
                if let Value::Array(items) = v {
                    let i = resolve_index(*index, items.len()).ok_or(JsonPathError::OutOfBounds {
                        index: *index,
                        length: items.len(),
                    })?;
                    out.push(items[i].clone());
                }
            }
        }
        Step::Slice(start, end) => {
            for v in &input {
                if let Value::Array(items) = v {
                    let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                    let clamp = |b: i64| if b < 0 { (len + b).max(0) } else { b.min(len) };
                    let from = start.map_or(0, clamp);
                    let to = end.map_or(len, clamp);
                    if from < to {
                        let (from, to) = (usize::try_from(from).unwrap_or(0), usize::try_from(to).unwrap_or(0));
                        out.extend(items[from..to].iter().cloned());
                    }
                }
            }
        }
        Step::Union(indices) => {
            for v in &input {
                if let Value::Array(items) = v {
                    for index in indices {
                        if let Some(i) = resolve_index(*index, items.len()) {
                            out.push(items[i].clone());
                        }
                    }
                }
            }
        }
        Step::Filter(filter) => {
            for v in input {
                let candidates = match v {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                for item in candidates {
                    if filter_matches(filter, &item) {
                        out.push(item);
                    }
                }
            }
        }
    }
    Ok(out)
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len_i = i64::try_from(len).ok()?;
    let i = if index < 0 { len_i + index } else { index };
    (0..len_i).contains(&i).then(|| usize::try_from(i).ok()).flatten()
}

fn collect_recursive(value: &Value, name: &str, out: &mut Vec<Value>) {
    match value {
        Value::Object(map) => {
            if let Some(v) = map.get(name) {
                out.push(v.clone());
            }
            for v in map.values() {
                collect_recursive(v, name, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_recursive(v, name, out);
            }
        }
        _ => {}
    }
}

fn filter_matches(filter: &Filter, item: &Value) -> bool {
    let Ok(found) = evaluate(&filter.path, item) else {
        return false;
    };
    let Some((op, literal)) = &filter.comparison else {
        return !found.is_empty();
    };
    found.iter().any(|v| compare(v, *op, literal))
}

fn compare(lhs: &Value, op: CompareOp, rhs: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (a, b) if a == b => Some(Ordering::Equal),
        _ => None,
    };
    match (op, ordering) {
        (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
        (CompareOp::Ne, o) => o != Some(Ordering::Equal),
        (CompareOp::Lt, Some(o)) => o == Ordering::Less,
        (CompareOp::Le, Some(o)) => o != Ordering::Greater,
        (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
        (CompareOp::Ge, Some(o)) => o != Ordering::Less,
        _ => false,
    }
}
