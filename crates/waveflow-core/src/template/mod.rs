//! # Template Expressions
//!
//! The `{{ ... }}` expression language that wires dataflow through a
//! workflow. A template string interleaves literal text with expressions
//! of two shapes:
//!
//! ```text
//! {{input.<path>}}                workflow (or task) input
//! {{tasks.<stepId>.output.<path>}} upstream step output
//! ```
//!
//! Paths are dot-separated; the leaf may be omitted to reference the
//! whole object. A template that is a single expression resolves to the
//! referenced value with its original JSON type; mixed templates
//! stringify each expression and concatenate.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};

static IDENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+$").expect("identifier pattern is valid")
});

/// A parsed expression inside `{{ }}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateExpr {
    /// `input` or `input.<path>`.
    Input { path: Vec<String> },
    /// `tasks.<stepId>.output` or `tasks.<stepId>.output.<path>`.
    TaskOutput { step_id: String, path: Vec<String> },
}

impl fmt::Display for TemplateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateExpr::Input { path } => {
                write!(f, "{{{{input")?;
                for part in path {
                    write!(f, ".{}", part)?;
                }
                write!(f, "}}}}")
            }
            TemplateExpr::TaskOutput { step_id, path } => {
                write!(f, "{{{{tasks.{}.output", step_id)?;
                for part in path {
                    write!(f, ".{}", part)?;
                }
                write!(f, "}}}}")
            }
        }
    }
}

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSegment {
    Literal(String),
    Expr(TemplateExpr),
}

/// A parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    segments: Vec<TemplateSegment>,
}

impl Template {
    /// Parse a template string into an ordered segment sequence.
    ///
    /// Fails with `template-malformed` on unbalanced braces or an
    /// unrecognized root identifier.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = raw;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(TemplateSegment::Literal(rest[..open].to_string()));
            }
            let after_open = &rest[open + 2..];
            let Some(close) = after_open.find("}}") else {
                return Err(malformed(raw, "unbalanced braces: missing '}}'"));
            };
            let inner = &after_open[..close];
            segments.push(TemplateSegment::Expr(parse_expr(raw, inner)?));
            rest = &after_open[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(TemplateSegment::Literal(rest.to_string()));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[TemplateSegment] {
        &self.segments
    }

    /// The expression, when the template is exactly one expression with
    /// no surrounding literal text.
    pub fn as_single_expression(&self) -> Option<&TemplateExpr> {
        match self.segments.as_slice() {
            [TemplateSegment::Expr(expr)] => Some(expr),
            _ => None,
        }
    }

    /// Step ids referenced through `tasks.<id>` expressions, in order of
    /// appearance. Feeds implicit dependency edges in the graph builder.
    pub fn referenced_steps(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                TemplateSegment::Expr(TemplateExpr::TaskOutput { step_id, .. }) => {
                    Some(step_id.as_str())
                }
                _ => None,
            })
            .collect()
    }

    /// Evaluate against an execution context.
    ///
    /// A single-expression template returns the referenced value with its
    /// original type; mixed templates concatenate stringified values.
    /// Missing paths yield `null` (single) or the empty string
    /// (interpolated) unless `strict` is set, in which case they fail with
    /// `template-missing`.
    pub fn resolve(&self, context: &ExecutionContext, strict: bool) -> Result<Value> {
        if let Some(expr) = self.as_single_expression() {
            return match lookup(expr, context) {
                Some(value) => Ok(value.clone()),
                None if strict => Err(EngineError::TemplateMissing {
                    expression: expr.to_string(),
                }),
                None => Ok(Value::Null),
            };
        }

        let mut rendered = String::new();
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(text) => rendered.push_str(text),
                TemplateSegment::Expr(expr) => match lookup(expr, context) {
                    Some(value) => rendered.push_str(&stringify(value)),
                    None if strict => {
                        return Err(EngineError::TemplateMissing {
                            expression: expr.to_string(),
                        })
                    }
                    None => {}
                },
            }
        }
        Ok(Value::String(rendered))
    }
}

fn parse_expr(raw: &str, inner: &str) -> Result<TemplateExpr> {
    // Whitespace inside the braces carries no meaning.
    let parts: Vec<&str> = inner.split('.').map(str::trim).collect();
    let root = parts.first().copied().unwrap_or("");

    match root {
        "input" => {
            let path = path_from(raw, &parts[1..])?;
            Ok(TemplateExpr::Input { path })
        }
        "tasks" => {
            if parts.len() < 3 {
                return Err(malformed(
                    raw,
                    "task references take the form tasks.<stepId>.output[.<path>]",
                ));
            }
            let step_id = parts[1];
            if !IDENT.is_match(step_id) {
                return Err(malformed(raw, &format!("invalid step id '{}'", step_id)));
            }
            if parts[2] != "output" {
                return Err(malformed(
                    raw,
                    &format!("expected 'output' after step id, found '{}'", parts[2]),
                ));
            }
            let path = path_from(raw, &parts[3..])?;
            Ok(TemplateExpr::TaskOutput {
                step_id: step_id.to_string(),
                path,
            })
        }
        "" => Err(malformed(raw, "empty expression")),
        other => Err(malformed(
            raw,
            &format!("unrecognized root '{}': expected 'input' or 'tasks'", other),
        )),
    }
}

fn path_from(raw: &str, parts: &[&str]) -> Result<Vec<String>> {
    parts
        .iter()
        .map(|part| {
            if IDENT.is_match(part) {
                Ok(part.to_string())
            } else {
                Err(malformed(raw, &format!("invalid path segment '{}'", part)))
            }
        })
        .collect()
}

fn lookup<'a>(expr: &TemplateExpr, context: &'a ExecutionContext) -> Option<&'a Value> {
    match expr {
        TemplateExpr::Input { path } => context.lookup_input(path),
        TemplateExpr::TaskOutput { step_id, path } => context.lookup_task_output(step_id, path),
    }
}

/// Interpolation rendering: `null` disappears, strings stay bare, and
/// composites render as canonical JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn malformed(template: &str, message: &str) -> EngineError {
    EngineError::TemplateMalformed {
        template: template.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(json!({
            "name": "ada",
            "count": 3,
            "nested": {"city": "London"}
        }));
        ctx.record_output("fetch", json!({"x": "left", "score": 0.5, "obj": {"k": 1}}));
        ctx
    }

    #[test]
    fn literal_only_round_trips() {
        let template = Template::parse("plain text").unwrap();
        assert_eq!(
            template.resolve(&context(), false).unwrap(),
            json!("plain text")
        );
    }

    #[test]
    fn single_expression_keeps_original_type() {
        let ctx = context();
        assert_eq!(
            Template::parse("{{input.count}}").unwrap().resolve(&ctx, false).unwrap(),
            json!(3)
        );
        assert_eq!(
            Template::parse("{{input.nested}}").unwrap().resolve(&ctx, false).unwrap(),
            json!({"city": "London"})
        );
        assert_eq!(
            Template::parse("{{tasks.fetch.output.score}}")
                .unwrap()
                .resolve(&ctx, false)
                .unwrap(),
            json!(0.5)
        );
    }

    #[test]
    fn omitted_leaf_returns_whole_object() {
        let ctx = context();
        assert_eq!(
            Template::parse("{{tasks.fetch.output}}")
                .unwrap()
                .resolve(&ctx, false)
                .unwrap(),
            json!({"x": "left", "score": 0.5, "obj": {"k": 1}})
        );
        assert_eq!(
            Template::parse("{{input}}").unwrap().resolve(&ctx, false).unwrap(),
            json!({"name": "ada", "count": 3, "nested": {"city": "London"}})
        );
    }

    #[test]
    fn interpolation_stringifies_and_concatenates() {
        let ctx = context();
        let template = Template::parse("{{input.name}}-{{tasks.fetch.output.x}}").unwrap();
        assert_eq!(template.resolve(&ctx, false).unwrap(), json!("ada-left"));

        let template = Template::parse("obj={{tasks.fetch.output.obj}}").unwrap();
        assert_eq!(
            template.resolve(&ctx, false).unwrap(),
            json!("obj={\"k\":1}")
        );
    }

    #[test]
    fn whitespace_inside_braces_is_ignored() {
        let ctx = context();
        let template = Template::parse("{{ input.name }}").unwrap();
        assert_eq!(template.resolve(&ctx, false).unwrap(), json!("ada"));
    }

    #[test]
    fn missing_paths_are_lenient_by_default() {
        let ctx = context();
        assert_eq!(
            Template::parse("{{input.absent}}").unwrap().resolve(&ctx, false).unwrap(),
            Value::Null
        );
        assert_eq!(
            Template::parse("got: {{input.absent}}")
                .unwrap()
                .resolve(&ctx, false)
                .unwrap(),
            json!("got: ")
        );
    }

    #[test]
    fn strict_mode_fails_on_missing_paths() {
        let error = Template::parse("{{input.absent}}")
            .unwrap()
            .resolve(&context(), true)
            .unwrap_err();
        assert_eq!(error.kind(), "template-missing");
    }

    #[test]
    fn unbalanced_braces_are_malformed() {
        let error = Template::parse("{{input.name").unwrap_err();
        assert_eq!(error.kind(), "template-malformed");
    }

    #[test]
    fn unknown_roots_are_malformed() {
        for raw in ["{{env.HOME}}", "{{}}", "{{tasks.a.result.x}}", "{{tasks.a}}"] {
            let error = Template::parse(raw).unwrap_err();
            assert_eq!(error.kind(), "template-malformed", "template {:?}", raw);
        }
    }

    #[test]
    fn referenced_steps_are_extracted_in_order() {
        let template =
            Template::parse("{{tasks.left.output.x}}-{{tasks.right.output.x}}").unwrap();
        assert_eq!(template.referenced_steps(), vec!["left", "right"]);
    }
}
