//! GitHub-Actions-style `${{ expr }}` interpolation and condition evaluation
//! (spec.md §4.3).
//!
//! Resolution never fails: unresolved references become the empty string,
//! and any internal evaluator error causes a condition to default to `false`
//! (logged as a warning) rather than propagating. This mirrors spec.md §7's
//! `ExpressionEvaluation` error class, which is never surfaced.

use crate::state::TaskResult;
use std::collections::HashMap;

/// Everything the expression engine can read from.
///
/// The runner passes two different `env` maps depending on execution target
/// (spec.md §4.3: *full* host+workflow+task+CLI for local execution, vs.
/// *declared* workflow+task+CLI only for containers); `ExprContext` is
/// agnostic to which one it's handed.
pub struct ExprContext<'a> {
    pub env: &'a HashMap<String, String>,
    pub tasks: &'a HashMap<String, TaskResult>,
    pub workflow_name: &'a str,
    pub run_id: &'a str,
    pub params: &'a HashMap<String, String>,
    /// Only populated during matrix expansion (spec.md §4.2); `None` at
    /// workflow-run time.
    pub matrix: Option<&'a HashMap<String, String>>,
    pub cancelled: bool,
}

/// A value produced by evaluating a (sub-)expression.
#[derive(Debug, Clone)]
enum Value {
    Bool(bool),
    Str(String),
}

impl Value {
    fn into_string(self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => s,
        }
    }

    /// Truthiness per spec.md §4.3: empty, whitespace-only, "0", and
    /// case-insensitive "false" are falsy; everything else is truthy.
    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Str(s) => {
                let t = s.trim();
                !(t.is_empty() || t == "0" || t.eq_ignore_ascii_case("false"))
            }
        }
    }
}

/// Replace every `${{ <expr> }}` occurrence in `s` with the string value of
/// its inner expression (spec.md §4.3). Identity when `s` contains no
/// `${{ `.
pub fn interpolate(s: &str, ctx: &ExprContext) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    loop {
        match rest.find("${{") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + 3..];
                match after.find("}}") {
                    None => {
                        // Unterminated template: emit verbatim, stop scanning.
                        out.push_str(&rest[start..]);
                        break;
                    }
                    Some(end) => {
                        let inner = &after[..end];
                        let value = eval_value(inner.trim(), ctx).unwrap_or_else(|e| {
                            tracing::warn!("expression evaluation failed: {e}");
                            Value::Str(String::new())
                        });
                        out.push_str(&value.into_string());
                        rest = &after[end + 2..];
                    }
                }
            }
        }
    }
    out
}

/// Evaluate a condition expression to bool (spec.md §4.3).
///
/// `raw` may or may not be wrapped in `${{ }}`; both forms are accepted so
/// callers can pass a task's `If` field verbatim.
pub fn evaluate_condition(raw: &str, ctx: &ExprContext) -> bool {
    let trimmed = raw.trim();
    let inner = strip_template_wrapper(trimmed);
    match eval_value(inner, ctx) {
        Ok(v) => v.truthy(),
        Err(e) => {
            tracing::warn!("condition evaluation failed, defaulting to false: {e}");
            false
        }
    }
}

fn strip_template_wrapper(s: &str) -> &str {
    if let Some(body) = s.strip_prefix("${{") {
        if let Some(body) = body.strip_suffix("}}") {
            return body.trim();
        }
    }
    s
}

type EvalResult = Result<Value, String>;

/// Recursive-descent parser/evaluator. Precedence (spec.md §4.3):
/// parens, `!`, `&&`, `||`, with comparisons and status/string/json
/// functions as leaves.
struct Parser<'a, 'b> {
    src: &'a str,
    pos: usize,
    ctx: &'a ExprContext<'b>,
}

fn eval_value(expr: &str, ctx: &ExprContext) -> EvalResult {
    let mut p = Parser {
        src: expr,
        pos: 0,
        ctx,
    };
    let v = p.parse_or()?;
    p.skip_ws();
    if p.pos != p.src.len() {
        return Err(format!("trailing input at byte {}: {:?}", p.pos, &p.src[p.pos..]));
    }
    Ok(v)
}

impl<'a, 'b> Parser<'a, 'b> {
    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src.as_bytes()[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn eat(&mut self, tok: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(tok) {
            self.pos += tok.len();
            true
        } else {
            false
        }
    }

    fn peek(&mut self, tok: &str) -> bool {
        self.skip_ws();
        self.rest().starts_with(tok)
    }

    fn parse_or(&mut self) -> EvalResult {
        let mut left = self.parse_and()?;
        loop {
            if self.eat("||") {
                let right = self.parse_and()?;
                left = Value::Bool(left.truthy() || right.truthy());
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> EvalResult {
        let mut left = self.parse_unary()?;
        loop {
            if self.eat("&&") {
                let right = self.parse_unary()?;
                left = Value::Bool(left.truthy() && right.truthy());
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> EvalResult {
        if self.eat("!") {
            let v = self.parse_unary()?;
            return Ok(Value::Bool(!v.truthy()));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> EvalResult {
        let left = self.parse_atom()?;
        self.skip_ws();
        for op in ["==", "!=", ">=", "<=", ">", "<"] {
            if self.peek(op) {
                self.pos += op.len();
                let right = self.parse_atom()?;
                return Ok(Value::Bool(compare(&left, &right, op)));
            }
        }
        Ok(left)
    }

    fn parse_atom(&mut self) -> EvalResult {
        self.skip_ws();
        if self.eat("(") {
            let v = self.parse_or()?;
            if !self.eat(")") {
                return Err("expected ')'".to_string());
            }
            return Ok(v);
        }
        if self.eat("!") {
            let v = self.parse_atom()?;
            return Ok(Value::Bool(!v.truthy()));
        }
        // String literal.
        self.skip_ws();
        if self.rest().starts_with('\'') || self.rest().starts_with('"') {
            return self.parse_string_literal();
        }
        // Identifier / function-call / dotted path.
        let ident = self.parse_ident();
        if ident.is_empty() {
            return Err(format!("unexpected input at byte {}", self.pos));
        }
        self.skip_ws();
        if self.rest().starts_with('(') {
            self.pos += 1;
            let args = self.parse_args()?;
            self.skip_ws();
            if !self.eat(")") {
                return Err("expected ')' after arguments".to_string());
            }
            let result = call_function(&ident, &args, self.ctx)?;
            // `fromJson(expr).path` — a trailing dotted/indexed path after
            // the call (spec.md §4.3 JSON function).
            if ident == "fromJson" {
                self.skip_ws();
                let path = self.parse_trailing_path();
                if !path.is_empty() {
                    return Ok(Value::Str(json_path(&result.into_string(), &path)));
                }
            }
            return Ok(result);
        }
        // Bare dotted path (env.X, tasks.X.output, workflow.name, ...).
        let mut path = ident;
        path.push_str(&self.parse_trailing_path());
        Ok(Value::Str(resolve_path(&path, self.ctx)))
    }

    fn parse_ident(&mut self) -> String {
        self.skip_ws();
        let start = self.pos;
        let bytes = self.src.as_bytes();
        while self.pos < bytes.len() {
            let c = bytes[self.pos] as char;
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.src[start..self.pos].to_string()
    }

    /// Consumes a run of `.ident` / `[N]` segments (no surrounding
    /// whitespace allowed, matching a dotted path token).
    fn parse_trailing_path(&mut self) -> String {
        let start = self.pos;
        let bytes = self.src.as_bytes();
        while self.pos < bytes.len() {
            match bytes[self.pos] as char {
                '.' => {
                    self.pos += 1;
                    while self.pos < bytes.len() {
                        let c = bytes[self.pos] as char;
                        if c.is_ascii_alphanumeric() || c == '_' {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                '[' => {
                    self.pos += 1;
                    while self.pos < bytes.len() && bytes[self.pos] as char != ']' {
                        self.pos += 1;
                    }
                    if self.pos < bytes.len() {
                        self.pos += 1; // consume ']'
                    }
                }
                _ => break,
            }
        }
        self.src[start..self.pos].to_string()
    }

    fn parse_string_literal(&mut self) -> EvalResult {
        let quote = self.src.as_bytes()[self.pos] as char;
        self.pos += 1;
        let start = self.pos;
        let bytes = self.src.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos] as char != quote {
            self.pos += 1;
        }
        let s = self.src[start..self.pos].to_string();
        if self.pos < bytes.len() {
            self.pos += 1; // closing quote
        }
        Ok(Value::Str(s))
    }

    fn parse_args(&mut self) -> Result<Vec<Value>, String> {
        let mut args = Vec::new();
        self.skip_ws();
        if self.peek(")") {
            return Ok(args);
        }
        loop {
            let v = self.parse_or()?;
            args.push(v);
            self.skip_ws();
            if self.eat(",") {
                continue;
            }
            break;
        }
        Ok(args)
    }
}

/// Strips a single layer of surrounding quotes if present (spec.md §4.3:
/// string functions are "quote-tolerant").
fn unquote(s: &str) -> &str {
    let b = s.as_bytes();
    if b.len() >= 2 && (b[0] == b'\'' || b[0] == b'"') && b[b.len() - 1] == b[0] {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn call_function(name: &str, args: &[Value], ctx: &ExprContext) -> EvalResult {
    match name {
        "success" => Ok(Value::Bool(status_success(ctx))),
        "failure" => Ok(Value::Bool(status_failure(ctx))),
        "cancelled" => Ok(Value::Bool(ctx.cancelled)),
        "always" => Ok(Value::Bool(true)),
        "contains" => {
            let (s, sub) = two_str(args)?;
            Ok(Value::Bool(
                unquote(&s).to_lowercase().contains(&unquote(&sub).to_lowercase()),
            ))
        }
        "startsWith" => {
            let (s, p) = two_str(args)?;
            Ok(Value::Bool(
                unquote(&s)
                    .to_lowercase()
                    .starts_with(&unquote(&p).to_lowercase()),
            ))
        }
        "endsWith" => {
            let (s, p) = two_str(args)?;
            Ok(Value::Bool(
                unquote(&s).to_lowercase().ends_with(&unquote(&p).to_lowercase()),
            ))
        }
        "equals" => {
            let (a, b) = two_str(args)?;
            Ok(Value::Bool(
                unquote(&a).eq_ignore_ascii_case(unquote(&b)),
            ))
        }
        "isEmpty" => {
            let s = one_str(args)?;
            Ok(Value::Bool(unquote(&s).is_empty()))
        }
        "isNotEmpty" => {
            let s = one_str(args)?;
            Ok(Value::Bool(!unquote(&s).is_empty()))
        }
        "fromJson" => {
            let s = one_str(args)?;
            Ok(Value::Str(s))
        }
        other => Err(format!("unknown function: {other}")),
    }
}

fn one_str(args: &[Value]) -> Result<String, String> {
    args.first()
        .map(|v| v.clone().into_string())
        .ok_or_else(|| "expected 1 argument".to_string())
}

fn two_str(args: &[Value]) -> Result<(String, String), String> {
    if args.len() < 2 {
        return Err("expected 2 arguments".to_string());
    }
    Ok((args[0].clone().into_string(), args[1].clone().into_string()))
}

/// `success()`: every dependency of the *current* task (its own `DependsOn`,
/// threaded through via `ctx`'s caller-supplied dependency list — see
/// `ExprContext::tasks`) is `IsSuccess`. The caller is responsible for
/// restricting `ctx.tasks` to the relevant dependency set when a custom
/// list is needed; with no restriction this checks everything recorded so
/// far, which is the "own DependsOn" default (spec.md §4.3).
fn status_success(ctx: &ExprContext) -> bool {
    ctx.tasks.values().all(|r| r.is_success())
}

fn status_failure(ctx: &ExprContext) -> bool {
    ctx.tasks.values().any(|r| r.is_failed())
}

fn resolve_path(path: &str, ctx: &ExprContext) -> String {
    let mut parts = path.splitn(2, '.');
    let head = parts.next().unwrap_or("");
    let tail = parts.next().unwrap_or("");
    match head {
        "env" => ctx.env.get(tail).cloned().unwrap_or_default(),
        "params" => ctx.params.get(tail).cloned().unwrap_or_default(),
        "matrix" => ctx
            .matrix
            .and_then(|m| m.get(tail))
            .cloned()
            .unwrap_or_default(),
        "workflow" => match tail {
            "name" | "id" => ctx.workflow_name.to_string(),
            "runid" => ctx.run_id.to_string(),
            _ => String::new(),
        },
        "tasks" => {
            let mut it = tail.splitn(2, '.');
            let task_id = it.next().unwrap_or("");
            let field = it.next().unwrap_or("");
            match ctx.tasks.get(task_id) {
                Some(result) => match field {
                    "output" => result.stdout_string(),
                    "exitcode" => result.exit_code.to_string(),
                    _ => String::new(),
                },
                None => String::new(),
            }
        }
        _ => String::new(),
    }
}

fn json_path(raw: &str, path: &str) -> String {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return String::new(),
    };
    let mut current = &value;
    for segment in tokenize_json_path(path) {
        match segment {
            PathSegment::Key(k) => match current.get(&k) {
                Some(v) => current = v,
                None => return String::new(),
            },
            PathSegment::Index(i) => match current.get(i) {
                Some(v) => current = v,
                None => return String::new(),
            },
        }
    }
    match current {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

enum PathSegment {
    Key(String),
    Index(usize),
}

fn tokenize_json_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    let mut chars = path.chars().peekable();
    let mut buf = String::new();
    while let Some(&c) = chars.peek() {
        match c {
            '.' => {
                chars.next();
                if !buf.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut buf)));
                }
            }
            '[' => {
                chars.next();
                if !buf.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut buf)));
                }
                let mut num = String::new();
                while let Some(&d) = chars.peek() {
                    if d == ']' {
                        chars.next();
                        break;
                    }
                    num.push(d);
                    chars.next();
                }
                if let Ok(i) = num.parse::<usize>() {
                    segments.push(PathSegment::Index(i));
                }
            }
            _ => {
                buf.push(c);
                chars.next();
            }
        }
    }
    if !buf.is_empty() {
        segments.push(PathSegment::Key(buf));
    }
    segments
}

fn compare(left: &Value, right: &Value, op: &str) -> bool {
    let l = left.clone().into_string();
    let r = right.clone().into_string();
    if let (Ok(lf), Ok(rf)) = (l.parse::<f64>(), r.parse::<f64>()) {
        const EPS: f64 = 1e-9;
        return match op {
            "==" => (lf - rf).abs() < EPS,
            "!=" => (lf - rf).abs() >= EPS,
            ">" => lf > rf,
            "<" => lf < rf,
            ">=" => lf >= rf,
            "<=" => lf <= rf,
            _ => false,
        };
    }
    match op {
        "==" => l == r,
        "!=" => l != r,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskOutputConfig;
    use crate::state::{TaskOutput, TaskResult, TaskStatus};

    fn empty_ctx<'a>(
        env: &'a HashMap<String, String>,
        tasks: &'a HashMap<String, TaskResult>,
        params: &'a HashMap<String, String>,
    ) -> ExprContext<'a> {
        ExprContext {
            env,
            tasks,
            workflow_name: "wf",
            run_id: "run-1",
            params,
            matrix: None,
            cancelled: false,
        }
    }

    #[test]
    fn interpolation_identity_without_template() {
        let env = HashMap::new();
        let tasks = HashMap::new();
        let params = HashMap::new();
        let ctx = empty_ctx(&env, &tasks, &params);
        assert_eq!(interpolate("plain text", &ctx), "plain text");
    }

    #[test]
    fn always_is_always_true() {
        let env = HashMap::new();
        let tasks = HashMap::new();
        let params = HashMap::new();
        let ctx = empty_ctx(&env, &tasks, &params);
        assert!(evaluate_condition("${{ always() }}", &ctx));
        assert!(evaluate_condition("always()", &ctx));
    }

    #[test]
    fn success_reflects_dependency_results() {
        let env = HashMap::new();
        let mut tasks = HashMap::new();
        tasks.insert(
            "a".to_string(),
            TaskResult::succeeded("a".into(), 0, TaskOutput::empty(), chrono::Utc::now()),
        );
        let params = HashMap::new();
        let ctx = empty_ctx(&env, &tasks, &params);
        assert!(evaluate_condition("success()", &ctx));

        let mut tasks2 = HashMap::new();
        tasks2.insert(
            "a".to_string(),
            TaskResult::failed("a".into(), 1, TaskOutput::empty(), "boom".into(), chrono::Utc::now()),
        );
        let ctx2 = empty_ctx(&env, &tasks2, &params);
        assert!(!evaluate_condition("success()", &ctx2));
        assert!(evaluate_condition("failure()", &ctx2));
        let _ = TaskStatus::Failed;
        let _ = TaskOutputConfig::default();
    }

    #[test]
    fn env_lookup_resolves_and_falls_back_to_empty() {
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        let tasks = HashMap::new();
        let params = HashMap::new();
        let ctx = empty_ctx(&env, &tasks, &params);
        assert_eq!(interpolate("${{ env.FOO }}", &ctx), "bar");
        assert_eq!(interpolate("${{ env.MISSING }}", &ctx), "");
    }

    #[test]
    fn from_json_round_trips_scalar_fields() {
        let env = HashMap::new();
        let mut tasks = HashMap::new();
        tasks.insert(
            "a".to_string(),
            TaskResult::succeeded(
                "a".into(),
                0,
                TaskOutput::from_stdout(r#"{"k": "v", "n": 3}"#.to_string()),
                chrono::Utc::now(),
            ),
        );
        let params = HashMap::new();
        let ctx = empty_ctx(&env, &tasks, &params);
        assert_eq!(
            interpolate("${{ fromJson(tasks.a.output).k }}", &ctx),
            "v"
        );
        assert_eq!(
            interpolate("${{ fromJson(tasks.a.output).n }}", &ctx),
            "3"
        );
        assert_eq!(
            interpolate("${{ fromJson(tasks.a.output).missing }}", &ctx),
            ""
        );
    }

    #[test]
    fn numeric_and_string_comparisons() {
        let env = HashMap::new();
        let tasks = HashMap::new();
        let params = HashMap::new();
        let ctx = empty_ctx(&env, &tasks, &params);
        assert!(evaluate_condition("3 > 2", &ctx));
        assert!(evaluate_condition("3.10 < 3.11", &ctx));
        assert!(evaluate_condition("'abc' == 'abc'", &ctx));
        assert!(!evaluate_condition("'abc' == 'abd'", &ctx));
    }

    #[test]
    fn truthiness_rules() {
        let env = HashMap::new();
        let tasks = HashMap::new();
        let params = HashMap::new();
        let ctx = empty_ctx(&env, &tasks, &params);
        assert!(!evaluate_condition("''", &ctx));
        assert!(!evaluate_condition("'0'", &ctx));
        assert!(!evaluate_condition("'false'", &ctx));
        assert!(evaluate_condition("'anything else'", &ctx));
    }

    #[test]
    fn boolean_operators() {
        let env = HashMap::new();
        let tasks = HashMap::new();
        let params = HashMap::new();
        let ctx = empty_ctx(&env, &tasks, &params);
        assert!(evaluate_condition("!false && (true || false)", &ctx));
    }
}
