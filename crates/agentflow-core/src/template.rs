// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Placeholder templating for step parameters.
//!
//! Steps carry parameters as JSON whose strings may embed `{{…}}`
//! references into the execution context, e.g.
//! `{{step_5.result.jobs[0].company}}` or a fallback chain
//! `{{step_3.result.resume_id||step_2.result.doc_id||"default"}}`.
//! Templates are parsed once into an AST and evaluated repeatedly
//! against the context. The resolver never errors: placeholders that
//! cannot be resolved are either replaced fail-open (fallback chains)
//! or left in place and reported as unresolved.

use crate::context::ExecutionContext;
use serde_json::{Map, Value};

/// One segment of a dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object key.
    Key(String),

    /// Array index from a `[N]` bracket.
    Index(usize),
}

/// One alternative inside a placeholder's fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alternative {
    /// A context path.
    Path(Vec<Segment>),

    /// A quoted literal, used as the final fallback.
    Literal(String),
}

/// A parsed template node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Verbatim text.
    Literal(String),

    /// A `{{…}}` reference with one or more alternatives.
    Placeholder {
        /// The original source text including braces, kept for
        /// unresolved reporting and fail-in-place rendering.
        raw: String,
        /// Alternatives tried in order.
        alternatives: Vec<Alternative>,
    },
}

/// A parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    nodes: Vec<Node>,
}

/// Outcome of resolving a value against the context.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// The resolved value.
    pub value: Value,

    /// Placeholder expressions that remained unresolved.
    pub unresolved: Vec<String>,
}

/// Split a dotted path into segments; `.` separates only outside
/// brackets, and each `[N]` becomes its own segment.
///
/// `step_5.result.jobs[0].company` →
/// `["step_5", "result", "jobs", "[0]", "company"]`.
pub fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_bracket = false;

    for ch in path.chars() {
        match ch {
            '.' if !in_bracket => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            '[' if !in_bracket => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                in_bracket = true;
                current.push('[');
            }
            ']' if in_bracket => {
                current.push(']');
                segments.push(std::mem::take(&mut current));
                in_bracket = false;
            }
            _ => current.push(ch),
        }
    }

    if !current.is_empty() {
        segments.push(current);
    }

    segments
}

fn parse_segments(path: &str) -> Vec<Segment> {
    split_path(path)
        .into_iter()
        .map(|raw| {
            if raw.starts_with('[') && raw.ends_with(']') {
                let inner = &raw[1..raw.len() - 1];
                match inner.parse::<usize>() {
                    Ok(index) => Segment::Index(index),
                    // Non-numeric bracket content degrades to a key lookup.
                    Err(_) => Segment::Key(inner.to_string()),
                }
            } else {
                Segment::Key(raw)
            }
        })
        .collect()
}

/// Split a placeholder body into alternatives on `||` or `|`,
/// respecting quoted literals.
fn split_alternatives(body: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = body.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' | '\'' => {
                match quote {
                    Some(q) if q == ch => quote = None,
                    None => quote = Some(ch),
                    _ => {}
                }
                current.push(ch);
            }
            '|' if quote.is_none() => {
                // A second pipe belongs to the same separator.
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }

    parts.push(current);
    parts
}

fn parse_alternative(raw: &str) -> Alternative {
    let trimmed = raw.trim();
    let is_quoted = trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')));

    if is_quoted {
        Alternative::Literal(trimmed[1..trimmed.len() - 1].to_string())
    } else {
        Alternative::Path(parse_segments(trimmed))
    }
}

impl Template {
    /// Parse a template string. Parsing never fails: an unterminated
    /// `{{` is kept as literal text.
    pub fn parse(input: &str) -> Self {
        let mut nodes = Vec::new();
        let mut rest = input;

        while let Some(open) = rest.find("{{") {
            match rest[open..].find("}}") {
                Some(close_rel) => {
                    let close = open + close_rel;
                    if open > 0 {
                        nodes.push(Node::Literal(rest[..open].to_string()));
                    }

                    let raw = rest[open..close + 2].to_string();
                    let body = &rest[open + 2..close];
                    let alternatives = split_alternatives(body)
                        .iter()
                        .map(|alt| parse_alternative(alt))
                        .collect();

                    nodes.push(Node::Placeholder { raw, alternatives });
                    rest = &rest[close + 2..];
                }
                None => break,
            }
        }

        if !rest.is_empty() {
            nodes.push(Node::Literal(rest.to_string()));
        }

        Self { nodes }
    }

    /// Whether the template contains no placeholders.
    pub fn is_static(&self) -> bool {
        self.nodes
            .iter()
            .all(|n| matches!(n, Node::Literal(_)))
    }

    /// Whether the template is exactly one placeholder and nothing else.
    fn is_single_placeholder(&self) -> bool {
        self.nodes.len() == 1 && matches!(self.nodes[0], Node::Placeholder { .. })
    }

    /// Render against the context.
    ///
    /// A template that is exactly one placeholder yields the underlying
    /// JSON value; mixed templates yield a string. Unresolved
    /// single-alternative placeholders stay in place and are reported.
    pub fn render(&self, ctx: &ExecutionContext) -> Resolved {
        if self.is_single_placeholder() {
            if let Node::Placeholder { raw, alternatives } = &self.nodes[0] {
                return match eval_placeholder(alternatives, ctx) {
                    Some(value) => Resolved {
                        value,
                        unresolved: Vec::new(),
                    },
                    None => Resolved {
                        value: Value::String(raw.clone()),
                        unresolved: vec![raw.clone()],
                    },
                };
            }
        }

        let mut out = String::new();
        let mut unresolved = Vec::new();

        for node in &self.nodes {
            match node {
                Node::Literal(text) => out.push_str(text),
                Node::Placeholder { raw, alternatives } => {
                    match eval_placeholder(alternatives, ctx) {
                        Some(value) => out.push_str(&stringify(&value)),
                        None => {
                            out.push_str(raw);
                            unresolved.push(raw.clone());
                        }
                    }
                }
            }
        }

        Resolved {
            value: Value::String(out),
            unresolved,
        }
    }
}

/// Evaluate a placeholder's alternatives in order.
///
/// Returns `None` only for a single-path placeholder whose lookup came
/// back null/missing; fallback chains fail open to the empty string.
fn eval_placeholder(alternatives: &[Alternative], ctx: &ExecutionContext) -> Option<Value> {
    let chained = alternatives.len() > 1;

    for alternative in alternatives {
        match alternative {
            Alternative::Literal(text) => return Some(Value::String(text.clone())),
            Alternative::Path(segments) => {
                let value = lookup(segments, ctx);
                match value {
                    Value::Null => continue,
                    // Empty string counts as absent in fallback chains only.
                    Value::String(ref s) if chained && s.is_empty() => continue,
                    other => return Some(other),
                }
            }
        }
    }

    if chained {
        Some(Value::String(String::new()))
    } else {
        None
    }
}

/// Navigate the context along a segment path. A missing key and an
/// existing null are both null.
fn lookup(segments: &[Segment], ctx: &ExecutionContext) -> Value {
    let mut iter = segments.iter();

    let root = match iter.next() {
        Some(Segment::Key(key)) => match ctx.get(key) {
            Some(value) => value,
            None => return Value::Null,
        },
        _ => return Value::Null,
    };

    let mut current = root;
    for segment in iter {
        let next = match segment {
            Segment::Key(key) => current.get(key).cloned(),
            Segment::Index(index) => current.get(index).cloned(),
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }

    current
}

/// Convert a resolved value into its string form for embedding.
/// One-element arrays collapse to their sole element.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) if items.len() == 1 => stringify(&items[0]),
        Value::Number(_) | Value::Bool(_) => value.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Resolve every string inside a JSON value against the context.
pub fn resolve_value(value: &Value, ctx: &ExecutionContext) -> Resolved {
    let mut unresolved = Vec::new();
    let value = resolve_inner(value, ctx, &mut unresolved);
    Resolved { value, unresolved }
}

fn resolve_inner(value: &Value, ctx: &ExecutionContext, unresolved: &mut Vec<String>) -> Value {
    match value {
        Value::String(text) => {
            let template = Template::parse(text);
            if template.is_static() {
                return value.clone();
            }
            let resolved = template.render(ctx);
            unresolved.extend(resolved.unresolved);
            resolved.value
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_inner(item, ctx, unresolved))
                .collect(),
        ),
        Value::Object(map) => {
            let resolved: Map<String, Value> = map
                .iter()
                .map(|(key, item)| (key.clone(), resolve_inner(item, ctx, unresolved)))
                .collect();
            Value::Object(resolved)
        }
        scalar => scalar.clone(),
    }
}

/// Collect all `step_N` numbers referenced by placeholders anywhere in
/// a JSON value. Used by plan validation to reject forward references.
pub fn collect_step_refs(value: &Value) -> Vec<u32> {
    let mut refs = Vec::new();
    collect_refs_inner(value, &mut refs);
    refs.sort_unstable();
    refs.dedup();
    refs
}

fn collect_refs_inner(value: &Value, refs: &mut Vec<u32>) {
    match value {
        Value::String(text) => {
            for node in Template::parse(text).nodes {
                if let Node::Placeholder { alternatives, .. } = node {
                    for alternative in alternatives {
                        if let Alternative::Path(segments) = alternative {
                            if let Some(Segment::Key(first)) = segments.first() {
                                if let Some(number) = first.strip_prefix("step_") {
                                    if let Ok(n) = number.parse::<u32>() {
                                        refs.push(n);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_refs_inner(item, refs);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_refs_inner(item, refs);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with(entries: Value) -> ExecutionContext {
        let ctx = ExecutionContext::new();
        if let Value::Object(map) = entries {
            for (key, value) in map {
                ctx.set(key, value);
            }
        }
        ctx
    }

    #[test]
    fn test_split_path() {
        assert_eq!(
            split_path("step_5.result.jobs[0].company"),
            vec!["step_5", "result", "jobs", "[0]", "company"]
        );
        assert_eq!(split_path("search_variants_count"), vec!["search_variants_count"]);
        assert_eq!(split_path("a[10][2].b"), vec!["a", "[10]", "[2]", "b"]);
    }

    #[test]
    fn test_static_template_is_identity() {
        let ctx = ExecutionContext::new();
        let input = json!({"text": "no placeholders here", "n": 42, "flag": true});
        let resolved = resolve_value(&input, &ctx);
        assert_eq!(resolved.value, input);
        assert!(resolved.unresolved.is_empty());
    }

    #[test]
    fn test_simple_path_resolution() {
        let ctx = ctx_with(json!({
            "step_1": {"result": {"jobs": [{"company": "ACME"}]}}
        }));

        let resolved = resolve_value(&json!("{{step_1.result.jobs[0].company}}"), &ctx);
        assert_eq!(resolved.value, json!("ACME"));
        assert!(resolved.unresolved.is_empty());
    }

    #[test]
    fn test_whole_string_placeholder_preserves_structure() {
        let ctx = ctx_with(json!({
            "step_1": {"result": {"jobs": [{"title": "a"}, {"title": "b"}]}}
        }));

        let resolved = resolve_value(&json!("{{step_1.result.jobs}}"), &ctx);
        assert_eq!(resolved.value, json!([{"title": "a"}, {"title": "b"}]));
    }

    #[test]
    fn test_embedded_placeholder_stringifies() {
        let ctx = ctx_with(json!({"step_1": {"result": {"count": 4}}}));

        let resolved = resolve_value(&json!("found {{step_1.result.count}} jobs"), &ctx);
        assert_eq!(resolved.value, json!("found 4 jobs"));
    }

    #[test]
    fn test_array_of_one_collapses_when_stringified() {
        let ctx = ctx_with(json!({"step_1": {"result": {"ids": ["doc-7"]}}}));

        let resolved = resolve_value(&json!("id={{step_1.result.ids}}"), &ctx);
        assert_eq!(resolved.value, json!("id=doc-7"));
    }

    // A null first alternative falls through to the next one.
    #[test]
    fn test_fallback_chain_first_non_null_wins() {
        let ctx = ctx_with(json!({
            "step_3": {"result": {"resume_id": null}},
            "step_2": {"result": {"doc_id": "7"}}
        }));

        let template = "{{step_3.result.resume_id||step_2.result.doc_id||\"default\"}}";
        let resolved = resolve_value(&json!(template), &ctx);
        assert_eq!(resolved.value, json!("7"));
        assert!(resolved.unresolved.is_empty());
    }

    #[test]
    fn test_fallback_chain_literal_fallback() {
        let ctx = ExecutionContext::new();
        let resolved = resolve_value(&json!("{{a||b||\"x\"}}"), &ctx);
        assert_eq!(resolved.value, json!("x"));
    }

    #[test]
    fn test_fallback_rejects_empty_string() {
        let ctx = ctx_with(json!({"a": "", "b": "fallback"}));
        let resolved = resolve_value(&json!("{{a||b}}"), &ctx);
        assert_eq!(resolved.value, json!("fallback"));
    }

    #[test]
    fn test_direct_lookup_accepts_empty_string() {
        let ctx = ctx_with(json!({"a": ""}));
        let resolved = resolve_value(&json!("{{a}}"), &ctx);
        assert_eq!(resolved.value, json!(""));
        assert!(resolved.unresolved.is_empty());
    }

    #[test]
    fn test_exhausted_fallback_chain_fails_open() {
        let ctx = ExecutionContext::new();
        let resolved = resolve_value(&json!("{{a||b}}"), &ctx);
        assert_eq!(resolved.value, json!(""));
        assert!(resolved.unresolved.is_empty());
    }

    #[test]
    fn test_single_pipe_separator() {
        let ctx = ctx_with(json!({"b": "value"}));
        let resolved = resolve_value(&json!("{{a|b}}"), &ctx);
        assert_eq!(resolved.value, json!("value"));
    }

    #[test]
    fn test_unresolved_single_path_stays_in_place() {
        let ctx = ExecutionContext::new();
        let resolved = resolve_value(&json!("{{step_9.result.id}}"), &ctx);
        assert_eq!(resolved.value, json!("{{step_9.result.id}}"));
        assert_eq!(resolved.unresolved, vec!["{{step_9.result.id}}"]);
    }

    #[test]
    fn test_unresolved_collected_from_nested_parameters() {
        let ctx = ExecutionContext::new();
        let params = json!({
            "query": "{{step_1.result.title}}",
            "nested": {"location": "{{step_2.result.city}}"}
        });

        let resolved = resolve_value(&params, &ctx);
        assert_eq!(resolved.unresolved.len(), 2);
    }

    #[test]
    fn test_missing_key_and_null_are_equivalent() {
        let ctx = ctx_with(json!({"present_null": null}));

        let via_null = resolve_value(&json!("{{present_null||\"d\"}}"), &ctx);
        let via_missing = resolve_value(&json!("{{absent||\"d\"}}"), &ctx);
        assert_eq!(via_null.value, via_missing.value);
    }

    #[test]
    fn test_determinism_across_runs() {
        let ctx = ctx_with(json!({"step_1": {"result": {"x": [1, 2, 3]}}}));
        let input = json!({"a": "{{step_1.result.x}}", "b": "n={{step_1.result.x[1]}}"});

        let first = resolve_value(&input, &ctx);
        let second = resolve_value(&input, &ctx);
        assert_eq!(first.value, second.value);
    }

    #[test]
    fn test_unterminated_placeholder_is_literal() {
        let ctx = ExecutionContext::new();
        let resolved = resolve_value(&json!("broken {{step_1.result"), &ctx);
        assert_eq!(resolved.value, json!("broken {{step_1.result"));
        assert!(resolved.unresolved.is_empty());
    }

    #[test]
    fn test_collect_step_refs() {
        let params = json!({
            "a": "{{step_3.result.id||step_2.result.id}}",
            "b": ["{{step_7.result.jobs[0]}}", "static"],
        });

        assert_eq!(collect_step_refs(&params), vec![2, 3, 7]);
    }

    #[test]
    fn test_quoted_pipe_is_not_a_separator() {
        let ctx = ExecutionContext::new();
        let resolved = resolve_value(&json!("{{missing||\"a|b\"}}"), &ctx);
        assert_eq!(resolved.value, json!("a|b"));
    }
}
