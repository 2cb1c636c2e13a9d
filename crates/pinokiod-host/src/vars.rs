//! `{{...}}` template resolution and the `when:` boolean grammar.
//!
//! Every string parameter the engine consumes passes through here first.
//! Resolution is total: an unknown reference fails with `unbound-variable`
//! instead of degrading to an empty string. The single documented exception
//! is a `when:` whose left-hand reference is unbound, which evaluates to
//! false. Expansion is recursive (resolved output may itself contain
//! templates) up to a fixed depth.

use pinokiod_core::{HostError, HostResult};
use serde_json::{Map, Value};
use std::collections::HashMap;

pub const MAX_TEMPLATE_DEPTH: usize = 8;

/// Side-effecting lookups a template may request: `{{port}}` allocates the
/// next free TCP port, `{{which('cmd')}}` searches PATH.
pub trait SystemLookups: Send + Sync {
    fn next_free_port(&self) -> HostResult<u16>;
    fn which(&self, cmd: &str) -> Option<String>;
}

/// Everything a frame exposes to templates.
#[derive(Clone, Debug, Default)]
pub struct VarScope {
    pub platform: String,
    pub arch: String,
    /// GPU vendor tag: `nvidia` or `none`.
    pub gpu: String,
    pub gpus: Vec<String>,
    pub cuda: String,
    pub cwd: String,
    pub app: String,
    pub args: Map<String, Value>,
    pub local: Map<String, Value>,
    pub envs: HashMap<String, String>,
    /// Output of the previous step.
    pub input: Value,
    /// The script object itself, for `{{self.*}}`.
    pub self_obj: Value,
}

pub struct Resolver<'a> {
    scope: &'a VarScope,
    lookups: &'a dyn SystemLookups,
}

impl<'a> Resolver<'a> {
    pub fn new(scope: &'a VarScope, lookups: &'a dyn SystemLookups) -> Self {
        Self { scope, lookups }
    }

    /// Expand all templates in `text`, recursively up to the depth cap.
    pub fn resolve(&self, text: &str) -> HostResult<String> {
        let mut current = text.to_string();
        for _ in 0..MAX_TEMPLATE_DEPTH {
            let (next, changed) = self.resolve_pass(&current)?;
            if !changed {
                return Ok(next);
            }
            current = next;
        }
        if find_template(&current).is_some() {
            return Err(HostError::parse(format!(
                "template recursion exceeded depth {MAX_TEMPLATE_DEPTH} in '{text}'"
            )));
        }
        Ok(current)
    }

    /// Resolve every string leaf of a JSON value in place.
    pub fn resolve_value(&self, value: &Value) -> HostResult<Value> {
        Ok(match value {
            Value::String(text) => Value::String(self.resolve(text)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item))
                    .collect::<HostResult<_>>()?,
            ),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.resolve_value(item)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }

    fn resolve_pass(&self, text: &str) -> HostResult<(String, bool)> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        let mut changed = false;
        while let Some((before, expr, after)) = split_template(rest) {
            out.push_str(before);
            let value = self
                .eval_expr(expr.trim())?
                .ok_or_else(|| HostError::UnboundVariable {
                    name: expr.trim().to_string(),
                })?;
            out.push_str(&stringify(&value));
            changed = true;
            rest = after;
        }
        out.push_str(rest);
        Ok((out, changed))
    }

    /// Evaluate one template expression. `Ok(None)` means unbound.
    fn eval_expr(&self, expr: &str) -> HostResult<Option<Value>> {
        // Ternary: {{gpu === 'nvidia' ? '--cuda' : '--cpu'}}
        if let Some((cond, branches)) = split_top_level(expr, '?') {
            let (on_true, on_false) =
                split_top_level(branches, ':').unwrap_or((branches, ""));
            let taken = if self.eval_when(cond.trim())? {
                on_true
            } else {
                on_false
            };
            return Ok(Some(Value::String(
                self.resolve(unquote(taken.trim()))?,
            )));
        }

        if let Some(arg) = parse_call(expr, "which") {
            let found = self.lookups.which(unquote(arg)).unwrap_or_default();
            return Ok(Some(Value::String(found)));
        }

        // Boolean operators inside a bare template resolve to the literal
        // true/false string so downstream `when:` parsing stays trivial.
        if contains_bool_operator(expr) {
            return Ok(Some(Value::Bool(self.eval_when(expr)?)));
        }

        self.lookup_path(expr)
    }

    fn lookup_path(&self, path: &str) -> HostResult<Option<Value>> {
        let scope = self.scope;
        let mut parts = path.split('.');
        let head = parts.next().unwrap_or_default();
        let (head, index) = split_index(head);
        let base: Option<Value> = match head {
            "platform" => Some(Value::String(scope.platform.clone())),
            "arch" => Some(Value::String(scope.arch.clone())),
            "gpu" => Some(Value::String(scope.gpu.clone())),
            "gpus" => Some(Value::Array(
                scope.gpus.iter().cloned().map(Value::String).collect(),
            )),
            "cuda" => Some(Value::String(scope.cuda.clone())),
            "cwd" => Some(Value::String(scope.cwd.clone())),
            "app" => Some(Value::String(scope.app.clone())),
            "timestamp" => Some(Value::from(
                time::OffsetDateTime::now_utc().unix_timestamp(),
            )),
            "port" => Some(Value::from(self.lookups.next_free_port()?)),
            "input" => Some(scope.input.clone()),
            "args" => Some(Value::Object(scope.args.clone())),
            "local" => Some(Value::Object(scope.local.clone())),
            "self" => Some(scope.self_obj.clone()),
            "env" => Some(Value::Object(
                scope
                    .envs
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            )),
            _ => None,
        };
        let Some(mut value) = base else {
            return Ok(None);
        };
        if let Some(i) = index {
            let Some(item) = value.get(i) else {
                return Ok(None);
            };
            value = item.clone();
        }
        for part in parts {
            let (key, index) = split_index(part);
            let Some(next) = value.get(key) else {
                return Ok(None);
            };
            value = next.clone();
            if let Some(i) = index {
                let Some(item) = value.get(i) else {
                    return Ok(None);
                };
                value = item.clone();
            }
        }
        Ok(Some(value))
    }

    /// Evaluate a `when:` expression. Accepts both the brace-wrapped form
    /// (`{{platform === 'linux'}}`) and plain text with embedded templates.
    pub fn eval_when(&self, raw: &str) -> HostResult<bool> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(true);
        }
        let inner = match whole_template(trimmed) {
            Some(inner) => inner.trim().to_string(),
            None => {
                // Substitute embedded templates first; an unbound reference
                // anywhere makes the condition false by the documented rule.
                match self.resolve(trimmed) {
                    Ok(text) => text,
                    Err(HostError::UnboundVariable { .. }) => return Ok(false),
                    Err(err) => return Err(err),
                }
            }
        };
        let tokens = tokenize(&inner)?;
        let mut parser = WhenParser {
            resolver: self,
            tokens,
            pos: 0,
        };
        let result = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(HostError::parse(format!(
                "trailing input in condition '{inner}'"
            )));
        }
        Ok(result)
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn contains_bool_operator(expr: &str) -> bool {
    expr.contains("===")
        || expr.contains("!==")
        || expr.contains("==")
        || expr.contains("!=")
        || expr.contains("&&")
        || expr.contains("||")
}

/// Split `text` at the first template: `(before, inner, after)`.
fn split_template(text: &str) -> Option<(&str, &str, &str)> {
    let start = text.find("{{")?;
    let end = text[start + 2..].find("}}")? + start + 2;
    Some((&text[..start], &text[start + 2..end], &text[end + 2..]))
}

fn find_template(text: &str) -> Option<usize> {
    let start = text.find("{{")?;
    text[start + 2..].find("}}").map(|_| start)
}

/// `{{ expr }}` covering the whole string, with no second group.
fn whole_template(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

/// Split at the first `sep` that sits outside quotes; skips `::`-free
/// grammar concerns because the grammar has no other use of `?`/`:`.
fn split_top_level(text: &str, sep: char) -> Option<(&str, &str)> {
    let mut quote: Option<char> = None;
    for (i, ch) in text.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(ch),
            (None, c) if c == sep => return Some((&text[..i], &text[i + 1..])),
            _ => {}
        }
    }
    None
}

fn parse_call<'t>(expr: &'t str, name: &str) -> Option<&'t str> {
    let rest = expr.strip_prefix(name)?.trim_start();
    let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
    Some(inner.trim())
}

fn unquote(text: &str) -> &str {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return &text[1..text.len() - 1];
        }
    }
    text
}

fn split_index(part: &str) -> (&str, Option<usize>) {
    let Some(open) = part.find('[') else {
        return (part, None);
    };
    let Some(close) = part.rfind(']') else {
        return (part, None);
    };
    let index = part[open + 1..close].parse().ok();
    (&part[..open], index)
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Neq,
    Str(String),
    Bool(bool),
    Ident(String),
}

fn tokenize(input: &str) -> HostResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                i += if chars.get(i + 2) == Some(&'=') { 3 } else { 2 };
                tokens.push(Token::Eq);
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                i += if chars.get(i + 2) == Some(&'=') { 3 } else { 2 };
                tokens.push(Token::Neq);
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '\'' | '"' => {
                let quote = ch;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(HostError::parse(format!(
                        "unterminated string in condition '{input}'"
                    )));
                }
                tokens.push(Token::Str(chars[start..j].iter().collect()));
                i = j + 1;
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric()
                        || matches!(chars[i], '_' | '.' | '[' | ']' | '-' | '/'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(HostError::parse(format!(
                    "unexpected '{other}' in condition '{input}'"
                )));
            }
        }
    }
    Ok(tokens)
}

struct WhenParser<'r, 'a> {
    resolver: &'r Resolver<'a>,
    tokens: Vec<Token>,
    pos: usize,
}

impl WhenParser<'_, '_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> HostResult<bool> {
        let mut value = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let rhs = self.and_expr()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn and_expr(&mut self) -> HostResult<bool> {
        let mut value = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let rhs = self.unary()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn unary(&mut self) -> HostResult<bool> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            return Ok(!self.unary()?);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> HostResult<bool> {
        let lhs = self.operand()?;
        match self.peek() {
            Some(Token::Eq) => {
                self.bump();
                let rhs = self.operand()?;
                // A comparison over an unbound reference is false outright,
                // for both polarities; the documented exception to
                // resolution totality.
                if matches!(lhs, Operand::Unbound) || matches!(rhs, Operand::Unbound) {
                    return Ok(false);
                }
                Ok(operand_eq(&lhs, &rhs))
            }
            Some(Token::Neq) => {
                self.bump();
                let rhs = self.operand()?;
                if matches!(lhs, Operand::Unbound) || matches!(rhs, Operand::Unbound) {
                    return Ok(false);
                }
                Ok(!operand_eq(&lhs, &rhs))
            }
            _ => Ok(truthy(&lhs)),
        }
    }

    fn operand(&mut self) -> HostResult<Operand> {
        match self.bump() {
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(Operand::Bool(value)),
                    _ => Err(HostError::parse("missing ')' in condition")),
                }
            }
            Some(Token::Str(text)) => Ok(Operand::Str(text)),
            Some(Token::Bool(flag)) => Ok(Operand::Bool(flag)),
            Some(Token::Ident(path)) => {
                // Unbound references compare as absent, the documented
                // exception to resolution totality.
                match self.resolver.lookup_path(&path)? {
                    Some(value) => Ok(Operand::Value(value)),
                    None if path.contains('.') || is_known_root(&path) => Ok(Operand::Unbound),
                    // A bare word like `nvidia` (often a pre-substituted
                    // template) reads as a string literal.
                    None => Ok(Operand::Str(path)),
                }
            }
            other => Err(HostError::parse(format!(
                "unexpected token {other:?} in condition"
            ))),
        }
    }
}

fn is_known_root(path: &str) -> bool {
    let head = path.split(['.', '[']).next().unwrap_or_default();
    matches!(
        head,
        "platform"
            | "arch"
            | "gpu"
            | "gpus"
            | "cuda"
            | "cwd"
            | "app"
            | "timestamp"
            | "port"
            | "input"
            | "args"
            | "local"
            | "self"
            | "env"
    )
}

#[derive(Debug)]
enum Operand {
    Str(String),
    Bool(bool),
    Value(Value),
    Unbound,
}

fn operand_eq(lhs: &Operand, rhs: &Operand) -> bool {
    operand_string(lhs) == operand_string(rhs)
}

fn operand_string(op: &Operand) -> String {
    match op {
        Operand::Str(s) => s.clone(),
        Operand::Bool(b) => b.to_string(),
        Operand::Value(v) => stringify(v),
        Operand::Unbound => String::new(),
    }
}

fn truthy(op: &Operand) -> bool {
    match op {
        Operand::Str(s) => !s.is_empty(),
        Operand::Bool(b) => *b,
        Operand::Unbound => false,
        Operand::Value(v) => match v {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::String(s) => !s.is_empty() && s != "false",
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            _ => true,
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    pub struct FakeLookups {
        pub ports: Mutex<Vec<u16>>,
        pub commands: HashMap<String, String>,
    }

    impl FakeLookups {
        pub fn new() -> Self {
            Self {
                ports: Mutex::new(vec![8188]),
                commands: HashMap::from([(
                    "git".to_string(),
                    "/usr/bin/git".to_string(),
                )]),
            }
        }
    }

    impl SystemLookups for FakeLookups {
        fn next_free_port(&self) -> HostResult<u16> {
            Ok(self.ports.lock().pop().unwrap_or(8189))
        }

        fn which(&self, cmd: &str) -> Option<String> {
            self.commands.get(cmd).cloned()
        }
    }

    pub fn scope() -> VarScope {
        VarScope {
            platform: "linux".into(),
            arch: "x86_64".into(),
            gpu: "nvidia".into(),
            gpus: vec!["NVIDIA A100".into()],
            cuda: "12.2".into(),
            cwd: "/pinokio/apps/hello".into(),
            app: "hello".into(),
            args: Map::from_iter([("mode".to_string(), Value::String("fast".into()))]),
            local: Map::from_iter([("n".to_string(), Value::String("again".into()))]),
            envs: HashMap::from([("HF_TOKEN".to_string(), "tok".to_string())]),
            input: Value::String("previous output".into()),
            self_obj: serde_json::json!({"version": "2.0"}),
        }
    }

    #[test]
    fn resolves_simple_paths() {
        let scope = scope();
        let lookups = FakeLookups::new();
        let r = Resolver::new(&scope, &lookups);
        assert_eq!(r.resolve("os={{platform}}").unwrap(), "os=linux");
        assert_eq!(r.resolve("{{args.mode}}").unwrap(), "fast");
        assert_eq!(r.resolve("{{local.n}}").unwrap(), "again");
        assert_eq!(r.resolve("{{env.HF_TOKEN}}").unwrap(), "tok");
        assert_eq!(r.resolve("{{gpus[0]}}").unwrap(), "NVIDIA A100");
        assert_eq!(r.resolve("{{self.version}}").unwrap(), "2.0");
        assert_eq!(r.resolve("{{input}}").unwrap(), "previous output");
    }

    #[test]
    fn unbound_reference_fails_not_empty() {
        let scope = scope();
        let lookups = FakeLookups::new();
        let r = Resolver::new(&scope, &lookups);
        let err = r.resolve("{{args.missing}}").unwrap_err();
        assert_eq!(err.kind(), "unbound-variable");
    }

    #[test]
    fn port_and_which_are_live_lookups() {
        let scope = scope();
        let lookups = FakeLookups::new();
        let r = Resolver::new(&scope, &lookups);
        assert_eq!(r.resolve("--port {{port}}").unwrap(), "--port 8188");
        assert_eq!(r.resolve("{{which('git')}}").unwrap(), "/usr/bin/git");
        assert_eq!(r.resolve("{{which('nope')}}").unwrap(), "");
    }

    #[test]
    fn ternary_selects_branch() {
        let scope = scope();
        let lookups = FakeLookups::new();
        let r = Resolver::new(&scope, &lookups);
        assert_eq!(
            r.resolve("{{gpu === 'nvidia' ? '--cuda' : '--cpu'}}").unwrap(),
            "--cuda"
        );
        assert_eq!(
            r.resolve("{{gpu === 'amd' ? '--rocm' : '--cpu'}}").unwrap(),
            "--cpu"
        );
    }

    #[test]
    fn recursion_resolves_nested_templates_to_fixed_depth() {
        let mut scope = scope();
        scope
            .local
            .insert("a".to_string(), Value::String("{{local.b}}".into()));
        scope
            .local
            .insert("b".to_string(), Value::String("deep".into()));
        let lookups = FakeLookups::new();
        let r = Resolver::new(&scope, &lookups);
        assert_eq!(r.resolve("{{local.a}}").unwrap(), "deep");

        scope
            .local
            .insert("loop".to_string(), Value::String("{{local.loop}}".into()));
        let r = Resolver::new(&scope, &lookups);
        let err = r.resolve("{{local.loop}}").unwrap_err();
        assert_eq!(err.kind(), "script-parse");
    }

    #[test]
    fn when_equality_and_boolean_grammar() {
        let scope = scope();
        let lookups = FakeLookups::new();
        let r = Resolver::new(&scope, &lookups);
        assert!(r.eval_when("{{platform === 'linux'}}").unwrap());
        assert!(!r.eval_when("{{platform !== 'linux'}}").unwrap());
        assert!(r.eval_when("{{platform === 'linux' && gpu === 'nvidia'}}").unwrap());
        assert!(r.eval_when("{{platform === 'win32' || gpu === 'nvidia'}}").unwrap());
        assert!(r.eval_when("{{!(platform === 'win32')}}").unwrap());
        assert!(r.eval_when("true").unwrap());
        assert!(!r.eval_when("false").unwrap());
    }

    #[test]
    fn when_unbound_lhs_is_false_not_error() {
        let scope = scope();
        let lookups = FakeLookups::new();
        let r = Resolver::new(&scope, &lookups);
        assert!(!r.eval_when("{{args.ghost === 'x'}}").unwrap());
        // Both polarities are false when the reference is unbound.
        assert!(!r.eval_when("{{args.ghost !== 'x'}}").unwrap());
        assert!(!r.eval_when("{{local.ghost}}").unwrap());
        // Bare truthiness negates normally.
        assert!(r.eval_when("{{!local.ghost}}").unwrap());
    }

    #[test]
    fn when_with_embedded_template_substitution() {
        let scope = scope();
        let lookups = FakeLookups::new();
        let r = Resolver::new(&scope, &lookups);
        assert!(r.eval_when("{{gpu}} === 'nvidia'").unwrap());
        assert!(!r.eval_when("{{args.ghost}} === 'x'").unwrap());
    }

    #[test]
    fn resolve_value_walks_structures() {
        let scope = scope();
        let lookups = FakeLookups::new();
        let r = Resolver::new(&scope, &lookups);
        let value = serde_json::json!({
            "cmd": ["echo {{app}}", "echo {{arch}}"],
            "n": 3,
        });
        let resolved = r.resolve_value(&value).unwrap();
        assert_eq!(resolved["cmd"][0], "echo hello");
        assert_eq!(resolved["cmd"][1], "echo x86_64");
        assert_eq!(resolved["n"], 3);
    }
}
