// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Recipe rendering
//!
//! A `meta.yaml` recipe is YAML wrapped in a Jinja subset with line
//! selectors. [`MetaYamlParser`] renders it for one platform: selector
//! comments (`# [win]`) drop lines, `{% set %}` defines variables,
//! `{% if %}` blocks are resolved, and `{{ ... }}` is substituted. The
//! result is parsed as YAML. Anything beyond that subset is left as text.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

/// Build platforms a recipe is rendered for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Windows
    Win,
    /// macOS
    Osx,
    /// Linux
    Linux,
}

impl Platform {
    /// Render order; later platforms win on scalar conflicts
    pub const ALL: [Self; 3] = [Self::Win, Self::Osx, Self::Linux];

    /// Truth value of a selector identifier on this platform
    #[must_use]
    pub fn selector(self, ident: &str) -> bool {
        match ident {
            "win" | "win32" | "win64" => self == Self::Win,
            "osx" => self == Self::Osx,
            "linux" | "linux64" => self == Self::Linux,
            "unix" => self != Self::Win,
            "py3k" | "x86_64" | "x86" => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Win => "win",
            Self::Osx => "osx",
            Self::Linux => "linux",
        })
    }
}

/// Turns recipe text into a parsed document for one platform
pub trait RecipeParser: Send + Sync {
    /// Render and parse `text` as seen on `platform`
    fn parse(&self, text: &str, platform: Platform) -> Result<Value>;
}

/// Selector and Jinja-subset renderer for `meta.yaml`
#[derive(Debug, Default, Clone, Copy)]
pub struct MetaYamlParser;

static SELECTOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*?)\s*#\s*\[(.+)\]\s*$").expect("Invalid selector regex"));
static STATEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\{%-?\s*(.*?)\s*-?%\}\s*$").expect("Invalid statement regex"));
static SET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^set\s+(\w+)\s*=\s*(.+)$").expect("Invalid set regex"));
static EXPRESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{-?\s*(.*?)\s*-?\}\}").expect("Invalid expression regex"));

impl RecipeParser for MetaYamlParser {
    fn parse(&self, text: &str, platform: Platform) -> Result<Value> {
        let rendered = render(text, platform);
        let yaml: serde_yaml::Value = serde_yaml::from_str(&rendered)
            .with_context(|| format!("Failed to parse recipe rendered for {platform}"))?;
        serde_json::to_value(yaml).context("Recipe is not representable as JSON")
    }
}

struct Branch {
    parent: bool,
    active: bool,
    taken: bool,
}

/// Render recipe text for `platform`, producing plain YAML
#[must_use]
pub fn render(text: &str, platform: Platform) -> String {
    let mut vars: BTreeMap<String, String> = BTreeMap::new();
    let mut branches: Vec<Branch> = Vec::new();
    let mut out = String::with_capacity(text.len());

    for raw_line in text.lines() {
        let mut line = raw_line.to_string();
        if let Some(caps) = SELECTOR.captures(raw_line) {
            if !eval_selector(&caps[2], platform, &vars) {
                continue;
            }
            line = caps[1].to_string();
        }

        let enabled = branches.iter().all(|b| b.active);
        if let Some(caps) = STATEMENT.captures(&line) {
            let statement = caps[1].to_string();
            let keyword = statement.split_whitespace().next().unwrap_or_default();
            let rest = statement[keyword.len()..].trim();
            match keyword {
                "set" if enabled => {
                    if let Some(set) = SET.captures(&statement) {
                        let value = eval_expression(&set[2], &vars);
                        vars.insert(set[1].to_string(), value);
                    }
                }
                "if" => {
                    let active = enabled && eval_selector(rest, platform, &vars);
                    branches.push(Branch {
                        parent: enabled,
                        active,
                        taken: active,
                    });
                }
                "elif" => {
                    if let Some(branch) = branches.last_mut() {
                        branch.active =
                            branch.parent && !branch.taken && eval_selector(rest, platform, &vars);
                        branch.taken |= branch.active;
                    }
                }
                "else" => {
                    if let Some(branch) = branches.last_mut() {
                        branch.active = branch.parent && !branch.taken;
                        branch.taken = true;
                    }
                }
                "endif" => {
                    branches.pop();
                }
                _ => {}
            }
            continue;
        }
        if !enabled {
            continue;
        }

        let substituted = EXPRESSION.replace_all(&line, |caps: &regex::Captures<'_>| {
            eval_expression(&caps[1], &vars)
        });
        out.push_str(&substituted);
        out.push('\n');
    }
    out
}

/// Merge per-platform documents: maps recursively, sequences unioned in
/// order, later scalars win, nulls never overwrite.
#[must_use]
pub fn merge_platforms(documents: impl IntoIterator<Item = Value>) -> Value {
    documents.into_iter().fold(Value::Null, merge_values)
}

fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (base, Value::Null) => base,
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (Value::Array(mut base), Value::Array(overlay)) => {
            for item in overlay {
                if !base.contains(&item) {
                    base.push(item);
                }
            }
            Value::Array(base)
        }
        (_, overlay) => overlay,
    }
}

// =============================================================================
// Expression evaluation
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(String),
    Op(String),
    Sym(char),
}

fn tokenize(expr: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' || c == '"' {
            let end = chars[i + 1..].iter().position(|&q| q == c)? + i + 1;
            tokens.push(Token::Str(chars[i + 1..end].iter().collect()));
            i = end + 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Num(chars[start..i].iter().collect()));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if matches!(c, '<' | '>' | '=' | '!') {
            let start = i;
            while i < chars.len() && matches!(chars[i], '<' | '>' | '=' | '!') {
                i += 1;
            }
            tokens.push(Token::Op(chars[start..i].iter().collect()));
        } else {
            tokens.push(Token::Sym(c));
            i += 1;
        }
    }
    Some(tokens)
}

struct Evaluator<'a> {
    tokens: Vec<Token>,
    pos: usize,
    vars: &'a BTreeMap<String, String>,
    platform: Option<Platform>,
}

impl<'a> Evaluator<'a> {
    fn new(expr: &str, vars: &'a BTreeMap<String, String>, platform: Option<Platform>) -> Option<Self> {
        Some(Self {
            tokens: tokenize(expr)?,
            pos: 0,
            vars,
            platform,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_sym(&mut self, sym: char) -> bool {
        if self.peek() == Some(&Token::Sym(sym)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn done(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // --- string expressions -------------------------------------------------

    fn concat(&mut self) -> Option<String> {
        let mut value = self.filtered()?;
        loop {
            if self.eat_sym('~') {
                value.push_str(&self.filtered()?);
            } else if self.eat_sym('+') {
                let rhs = self.filtered()?;
                value = match (value.parse::<i64>(), rhs.parse::<i64>()) {
                    (Ok(a), Ok(b)) => (a + b).to_string(),
                    _ => value + &rhs,
                };
            } else {
                return Some(value);
            }
        }
    }

    fn filtered(&mut self) -> Option<String> {
        let mut value = self.primary()?;
        while self.eat_sym('|') {
            let Some(Token::Ident(filter)) = self.next() else {
                return None;
            };
            let args = if self.eat_sym('(') { self.arguments()? } else { Vec::new() };
            value = apply_method(&value, &filter, &args);
        }
        Some(value)
    }

    fn arguments(&mut self) -> Option<Vec<String>> {
        let mut args = Vec::new();
        while !self.eat_sym(')') {
            if let (Some(Token::Ident(_)), Some(Token::Op(op))) =
                (self.tokens.get(self.pos), self.tokens.get(self.pos + 1))
            {
                if op == "=" {
                    self.pos += 2;
                    self.concat()?;
                    self.eat_sym(',');
                    continue;
                }
            }
            args.push(self.concat()?);
            if !self.eat_sym(',') && self.peek() != Some(&Token::Sym(')')) {
                return None;
            }
        }
        Some(args)
    }

    fn primary(&mut self) -> Option<String> {
        match self.next()? {
            Token::Str(s) | Token::Num(s) => self.postfix(s),
            Token::Sym('(') => {
                let value = self.concat()?;
                self.eat_sym(')').then_some(value)
            }
            Token::Ident(name) => {
                if self.eat_sym('(') {
                    let args = self.arguments()?;
                    return self.postfix(call_function(&name, &args));
                }
                let value = self.vars.get(&name).cloned().unwrap_or(name);
                self.postfix(value)
            }
            _ => None,
        }
    }

    fn postfix(&mut self, mut value: String) -> Option<String> {
        loop {
            if self.eat_sym('.') {
                let Some(Token::Ident(method)) = self.next() else {
                    return None;
                };
                let args = if self.eat_sym('(') { self.arguments()? } else { Vec::new() };
                value = apply_method(&value, &method, &args);
            } else if self.eat_sym('[') {
                let index = self.concat()?;
                if !self.eat_sym(']') {
                    return None;
                }
                if let Ok(i) = index.parse::<usize>() {
                    value = value.chars().nth(i).map(String::from).unwrap_or_default();
                }
            } else {
                return Some(value);
            }
        }
    }

    // --- selector expressions ----------------------------------------------

    fn or_expr(&mut self) -> Option<bool> {
        let mut value = self.and_expr()?;
        while self.eat_ident("or") {
            let rhs = self.and_expr()?;
            value = value || rhs;
        }
        Some(value)
    }

    fn and_expr(&mut self) -> Option<bool> {
        let mut value = self.not_expr()?;
        while self.eat_ident("and") {
            let rhs = self.not_expr()?;
            value = value && rhs;
        }
        Some(value)
    }

    fn not_expr(&mut self) -> Option<bool> {
        if self.eat_ident("not") {
            return Some(!self.not_expr()?);
        }
        if self.peek() == Some(&Token::Sym('(')) {
            self.pos += 1;
            let value = self.or_expr()?;
            return self.eat_sym(')').then_some(value);
        }
        let lhs_ident = match self.peek() {
            Some(Token::Ident(name)) if !self.vars.contains_key(name) => Some(name.clone()),
            _ => None,
        };
        let lhs = self.concat()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.concat()?;
            // Unknown build variables (py, numpy, ...) never match
            if lhs_ident.is_some() && self.platform.is_some() {
                return Some(false);
            }
            return Some(compare(&lhs, &op, &rhs));
        }
        Some(match (lhs_ident, self.platform) {
            (Some(ident), Some(platform)) => platform.selector(&ident),
            _ => !lhs.is_empty() && lhs != "False" && lhs != "0",
        })
    }
}

fn compare(lhs: &str, op: &str, rhs: &str) -> bool {
    let ordering = match (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b),
        _ => Some(lhs.cmp(rhs)),
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        "==" => ordering.is_eq(),
        "!=" => ordering.is_ne(),
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        ">" => ordering.is_gt(),
        ">=" => ordering.is_ge(),
        _ => false,
    }
}

fn call_function(name: &str, args: &[String]) -> String {
    match name {
        "compiler" => format!("{}_compiler_stub", args.first().map_or("c", String::as_str)),
        "pin_subpackage" | "pin_compatible" | "cdt" => args.first().cloned().unwrap_or_default(),
        _ => String::new(),
    }
}

fn apply_method(value: &str, method: &str, args: &[String]) -> String {
    match (method, args) {
        ("lower", _) => value.to_lowercase(),
        ("upper", _) => value.to_uppercase(),
        ("strip" | "trim", _) => value.trim().to_string(),
        ("replace", [from, to, ..]) => value.replace(from.as_str(), to),
        _ => value.to_string(),
    }
}

fn eval_expression(expr: &str, vars: &BTreeMap<String, String>) -> String {
    Evaluator::new(expr, vars, None)
        .and_then(|mut e| e.concat().filter(|_| e.done()))
        .unwrap_or_else(|| expr.trim().to_string())
}

fn eval_selector(expr: &str, platform: Platform, vars: &BTreeMap<String, String>) -> bool {
    Evaluator::new(expr, vars, Some(platform))
        .and_then(|mut e| e.or_expr().filter(|_| e.done()))
        .unwrap_or(false)
}
