//! Symbolic expression type used throughout the simplifier.
//!
//! Expressions are s-expression style trees such as
//! `("add", 1, ("mul", 2, "x"))`, modelled as an enum so the compiler can
//! help us keep things correct.
//!
//! Statements are expressions too: `setvar`, `setmem`, `if`, `while`,
//! `continue` and friends are just `Node`s with a well-known opcode, so the
//! same traversal helpers work on straight-line code and control flow alike.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum unsigned 256-bit value.
pub const UINT_256_MAX: U256 = U256::MAX;

// -- Serde helpers for U256 --------------------------------------------------

mod u256_serde {
    use primitive_types::U256;
    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize a U256 as a hex string (e.g. `"0x1a2b"`).
    pub fn serialize<S: Serializer>(val: &U256, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{val:x}"))
    }

    /// Deserialize a U256 from a hex string (with or without `0x` prefix).
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
        let hex_str = String::deserialize(d)?;
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(&hex_str);
        U256::from_str_radix(hex_str, 16).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Core expression type
// ---------------------------------------------------------------------------

/// A symbolic expression.
///
/// We intentionally keep this as a tree rather than a flat SSA form,
/// because every pass operates on tree patterns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    /// Concrete 256-bit value.
    Val(#[serde(with = "u256_serde")] U256),
    /// Symbolic string atom: `"caller"`, `"callvalue"`, `"msize"`, etc.
    Atom(String),
    /// Boolean literal.
    Bool(bool),
    /// A value nothing is known about, e.g. uninitialised memory.
    Unknown,
    /// A tagged node: `(opcode, children…)`.
    /// The first element is the opcode string and the rest are children.
    Node(String, Vec<Expr>),
}

impl Expr {
    // -- Convenience constructors ------------------------------------------

    /// Create a value expression from a `u64`.
    pub fn val(v: u64) -> Self {
        Expr::Val(U256::from(v))
    }

    /// Create a value expression from an `i64`, two's-complement encoded.
    pub fn val_i64(v: i64) -> Self {
        if v >= 0 {
            Expr::Val(U256::from(v as u64))
        } else {
            Expr::Val(U256::MAX - U256::from(v.unsigned_abs()) + U256::one())
        }
    }

    /// Create a named atom (symbolic constant, variable name, etc.).
    pub fn atom(s: &str) -> Self {
        Expr::Atom(s.to_string())
    }

    /// Create a node expression with an opcode and list of children.
    pub fn node(op: &str, children: Vec<Expr>) -> Self {
        Expr::Node(op.to_string(), children)
    }

    /// Create a node with zero children (e.g. `stop`, `invalid`).
    pub fn node0(op: &str) -> Self {
        Expr::Node(op.to_string(), vec![])
    }

    /// Create a node with one child.
    pub fn node1(op: &str, a: Expr) -> Self {
        Expr::Node(op.to_string(), vec![a])
    }

    /// Create a node with two children.
    pub fn node2(op: &str, a: Expr, b: Expr) -> Self {
        Expr::Node(op.to_string(), vec![a, b])
    }

    /// Create a node with three children (e.g. `if`).
    pub fn node3(op: &str, a: Expr, b: Expr, c: Expr) -> Self {
        Expr::Node(op.to_string(), vec![a, b, c])
    }

    /// Construct a node with 4 children (e.g. `mask_shl`, `while`).
    pub fn node4(op: &str, a: Expr, b: Expr, c: Expr, d: Expr) -> Self {
        Expr::Node(op.to_string(), vec![a, b, c, d])
    }

    /// A loop-local variable with a numeric index: `(var n)`.
    pub fn var(idx: u64) -> Self {
        Expr::node1("var", Expr::val(idx))
    }

    /// A byte range `(range start length)`.
    pub fn range(start: Expr, length: Expr) -> Self {
        Expr::node2("range", start, length)
    }

    /// A memory read over a range: `(mem (range start length))`.
    pub fn mem(start: Expr, length: Expr) -> Self {
        Expr::node1("mem", Expr::range(start, length))
    }

    /// A memory write statement: `(setmem (range start length) value)`.
    pub fn setmem(start: Expr, length: Expr, value: Expr) -> Self {
        Expr::node2("setmem", Expr::range(start, length), value)
    }

    /// A variable assignment statement.
    pub fn setvar(var: Expr, value: Expr) -> Self {
        Expr::node2("setvar", var, value)
    }

    // -- Predicates --------------------------------------------------------

    /// Return the opcode string if this is a `Node`, `None` otherwise.
    pub fn opcode(&self) -> Option<&str> {
        match self {
            Expr::Node(op, _) => Some(op.as_str()),
            _ => None,
        }
    }

    /// Return the children if this is a `Node`.
    pub fn children(&self) -> Option<&[Expr]> {
        match self {
            Expr::Node(_, ch) => Some(ch.as_slice()),
            _ => None,
        }
    }

    /// Return `true` if the expression is a concrete integer.
    pub fn is_val(&self) -> bool {
        matches!(self, Expr::Val(_))
    }

    /// Try to extract a concrete `U256`.
    pub fn as_val(&self) -> Option<U256> {
        match self {
            Expr::Val(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to extract as u64 (returns None if value > u64::MAX).
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Expr::Val(v) if *v <= U256::from(u64::MAX) => Some(v.low_u64()),
            _ => None,
        }
    }

    /// Interpret a concrete value as a signed integer near zero.
    ///
    /// Values within 8^22 of zero (in either direction, two's-complement)
    /// convert; everything else returns `None`.  This mirrors the display
    /// convention for negative literals.
    pub fn as_signed(&self) -> Option<i128> {
        let v = self.as_val()?;
        let window = U256::one() << 66; // 8^22
        if v < window {
            Some(v.low_u128() as i128)
        } else if v > U256::MAX - window {
            let neg = (U256::MAX - v) + U256::one();
            Some(-(neg.low_u128() as i128))
        } else {
            None
        }
    }

    /// Return `true` if all provided expressions are concrete integers.
    pub fn all_concrete(exprs: &[&Expr]) -> bool {
        exprs.iter().all(|e| e.is_val())
    }

    /// The zero expression.
    pub fn zero() -> Self {
        Expr::Val(U256::zero())
    }

    /// The one expression.
    pub fn one() -> Self {
        Expr::Val(U256::one())
    }

    /// Check if this is the zero value.
    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Val(v) if v.is_zero())
    }

    /// Check if this expression tree contains `target` anywhere.
    pub fn contains(&self, target: &Expr) -> bool {
        if self == target {
            return true;
        }
        match self {
            Expr::Node(_, children) => children.iter().any(|c| c.contains(target)),
            _ => false,
        }
    }

    /// Check if this expression tree contains an atom or node with the given opcode.
    pub fn contains_op(&self, op: &str) -> bool {
        match self {
            Expr::Node(o, children) => o == op || children.iter().any(|c| c.contains_op(op)),
            Expr::Atom(s) => s == op,
            _ => false,
        }
    }

    /// Replace all occurrences of `from` with `to` in this expression tree.
    pub fn replace(&self, from: &Expr, to: &Expr) -> Expr {
        if self == from {
            return to.clone();
        }
        match self {
            Expr::Node(op, children) => {
                let new_ch: Vec<Expr> = children.iter().map(|c| c.replace(from, to)).collect();
                Expr::Node(op.clone(), new_ch)
            }
            other => other.clone(),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Val(v) => {
                // Values just below 2^256 read as small negatives.
                if let Some(s) = self.as_signed() {
                    if s < 0 {
                        return write!(f, "{s}");
                    }
                }
                if *v <= U256::from(9999u64) {
                    write!(f, "{v}")
                } else {
                    write!(f, "0x{v:x}")
                }
            }
            Expr::Atom(s) => write!(f, "{s}"),
            Expr::Bool(b) => write!(f, "{b}"),
            Expr::Unknown => write!(f, "?"),
            Expr::Node(op, children) => {
                write!(f, "({op}")?;
                for c in children {
                    write!(f, " {c}")?;
                }
                write!(f, ")")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Trace type alias
// ---------------------------------------------------------------------------

/// A trace is just a flat list of expressions (each one is a "line").
pub type Trace = Vec<Expr>;
