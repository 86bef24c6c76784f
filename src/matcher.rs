//! Pattern matching on symbolic expressions.
//!
//! Match an expression against a pattern and extract named bindings.
//! Patterns support exact literals, wildcards, named captures, typed
//! integer captures (match only concrete values) and a trailing tail
//! capture that binds the remaining children of a node.

use crate::expr::Expr;
use std::collections::HashMap;

/// The result of a successful match — a map of named captures.
#[derive(Debug, Clone, Default)]
pub struct Match {
    pub bindings: HashMap<String, Expr>,
    pub tails: HashMap<String, Vec<Expr>>,
}

impl Match {
    /// Retrieve a captured expression by name.
    pub fn get(&self, name: &str) -> Option<&Expr> {
        self.bindings.get(name)
    }

    /// Retrieve a captured value (U256) by name, or `None` if not a concrete value.
    pub fn get_val(&self, name: &str) -> Option<primitive_types::U256> {
        self.bindings.get(name).and_then(|e| e.as_val())
    }

    /// Retrieve the children captured by a named tail pattern.
    pub fn get_tail(&self, name: &str) -> Option<&[Expr]> {
        self.tails.get(name).map(|v| v.as_slice())
    }
}

/// Pattern atoms used when building match patterns.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Match anything, don't capture.
    Any,
    /// Match anything and bind to the given name.
    Capture(String),
    /// Match only a concrete `Val` and bind it to the given name.
    CaptureVal(String),
    /// Match a specific concrete value.
    Val(primitive_types::U256),
    /// Match a specific atom string.
    Atom(String),
    /// Match a node with the given opcode and child patterns.
    Node(String, Vec<Pattern>),
    /// Match any remaining children, discarding them.
    /// `Some(name)` binds the consumed children, `None` discards them.
    /// Only valid as the last child pattern of a `Node`.
    Tail(Option<String>),
}

impl Pattern {
    /// A capture pattern that matches any expression and stores it under `name`.
    pub fn capture(name: &str) -> Self {
        Pattern::Capture(name.to_string())
    }

    /// A capture pattern restricted to concrete integer values.
    pub fn capture_val(name: &str) -> Self {
        Pattern::CaptureVal(name.to_string())
    }

    /// A pattern that matches a specific atom.
    pub fn atom(s: &str) -> Self {
        Pattern::Atom(s.to_string())
    }

    /// A pattern that matches a specific numeric value.
    pub fn val(v: u64) -> Self {
        Pattern::Val(primitive_types::U256::from(v))
    }

    /// A pattern that matches a node with the given opcode and child patterns.
    pub fn node(op: &str, children: Vec<Pattern>) -> Self {
        Pattern::Node(op.to_string(), children)
    }

    /// An anonymous tail: matches (and discards) remaining children.
    pub fn ellipsis() -> Self {
        Pattern::Tail(None)
    }

    /// A named tail: binds remaining children under `name`.
    pub fn tail(name: &str) -> Self {
        Pattern::Tail(Some(name.to_string()))
    }
}

/// Try to match `expr` against `pattern`.
/// Returns `Some(Match)` on success, `None` on failure.  A failed match
/// never leaks partial bindings.
pub fn match_expr(expr: &Expr, pattern: &Pattern) -> Option<Match> {
    let mut m = Match::default();
    if match_helper(expr, pattern, &mut m) {
        Some(m)
    } else {
        None
    }
}

fn match_helper(expr: &Expr, pattern: &Pattern, m: &mut Match) -> bool {
    match pattern {
        Pattern::Any => true,
        Pattern::Tail(_) => true, // top-level tail matches anything
        Pattern::Capture(name) => {
            if let Some(existing) = m.bindings.get(name) {
                existing == expr
            } else {
                m.bindings.insert(name.clone(), expr.clone());
                true
            }
        }
        Pattern::CaptureVal(name) => {
            if !expr.is_val() {
                return false;
            }
            if let Some(existing) = m.bindings.get(name) {
                existing == expr
            } else {
                m.bindings.insert(name.clone(), expr.clone());
                true
            }
        }
        Pattern::Val(v) => {
            matches!(expr, Expr::Val(ev) if ev == v)
        }
        Pattern::Atom(s) => {
            matches!(expr, Expr::Atom(ea) if ea == s)
        }
        Pattern::Node(op, children) => {
            if let Expr::Node(eop, echildren) = expr {
                if eop != op {
                    return false;
                }
                let mut ci = 0;
                let mut pi = 0;
                while pi < children.len() && ci < echildren.len() {
                    if let Pattern::Tail(name) = &children[pi] {
                        if let Some(name) = name {
                            m.tails.insert(name.clone(), echildren[ci..].to_vec());
                        }
                        return true;
                    }
                    if !match_helper(&echildren[ci], &children[pi], m) {
                        return false;
                    }
                    ci += 1;
                    pi += 1;
                }
                // A trailing tail may consume zero children.
                if pi < children.len() {
                    if let Pattern::Tail(name) = &children[pi] {
                        if let Some(name) = name {
                            m.tails.insert(name.clone(), vec![]);
                        }
                        return pi + 1 == children.len();
                    }
                }
                ci == echildren.len() && pi == children.len()
            } else {
                false
            }
        }
    }
}

/// Replace occurrences of `pattern` with `replacement` throughout `expr`.
/// Named captures in the replacement (atoms starting with `:`) are
/// substituted from the match bindings.
pub fn replace_pattern(expr: &Expr, pattern: &Pattern, replacement: &Expr) -> Expr {
    if let Some(m) = match_expr(expr, pattern) {
        substitute(replacement, &m)
    } else {
        match expr {
            Expr::Node(op, children) => {
                let new_children: Vec<Expr> = children
                    .iter()
                    .map(|c| replace_pattern(c, pattern, replacement))
                    .collect();
                Expr::Node(op.clone(), new_children)
            }
            other => other.clone(),
        }
    }
}

fn substitute(template: &Expr, m: &Match) -> Expr {
    match template {
        Expr::Atom(name) if name.starts_with(':') => {
            let key = &name[1..];
            m.bindings.get(key).cloned().unwrap_or_else(|| template.clone())
        }
        Expr::Node(op, children) => {
            let new_children: Vec<Expr> = children.iter().map(|c| substitute(c, m)).collect();
            Expr::Node(op.clone(), new_children)
        }
        other => other.clone(),
    }
}
