//! Symbolic algebra over 256-bit words.
//!
//! Operations here accept expressions that may or may not be concrete and
//! fold what they can, always staying exact modulo 2^256.  Comparisons
//! return an explicit [`Ternary`] because symbolic operands are often
//! genuinely undecidable, and conflating "no" with "don't know" is how
//! memory forwarding bugs happen.

use crate::core::masks;
use crate::expr::Expr;
use primitive_types::U256;

/// Three-valued logic for symbolic comparisons and overlap checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ternary {
    True,
    False,
    Unknown,
}

impl Ternary {
    pub fn from_bool(b: bool) -> Self {
        if b { Ternary::True } else { Ternary::False }
    }

    /// True only when definitely true.
    pub fn is_true(self) -> bool {
        self == Ternary::True
    }

    /// True only when definitely false.
    pub fn is_false(self) -> bool {
        self == Ternary::False
    }

    /// Logical negation; `Unknown` stays `Unknown`.
    pub fn not(self) -> Self {
        match self {
            Ternary::True => Ternary::False,
            Ternary::False => Ternary::True,
            Ternary::Unknown => Ternary::Unknown,
        }
    }
}

/// Signed reading of a word: values at or above 2^255 count as negative.
fn is_neg(v: U256) -> bool {
    v >= (U256::one() << 255)
}

fn signed_le(a: U256, b: U256) -> bool {
    match (is_neg(a), is_neg(b)) {
        (true, false) => true,
        (false, true) => false,
        _ => a <= b,
    }
}

// ---------------------------------------------------------------------------
// Term decomposition
// ---------------------------------------------------------------------------

/// Flatten nested `add` nodes into a list of terms.
fn add_terms(e: &Expr) -> Vec<Expr> {
    match e {
        Expr::Node(op, ch) if op == "add" => ch.iter().flat_map(add_terms).collect(),
        other => vec![other.clone()],
    }
}

/// Split a term into `(coefficient, base)` where term == coefficient * base.
fn term_coeff(term: &Expr) -> (U256, Expr) {
    match term {
        Expr::Val(v) => (*v, Expr::one()),
        Expr::Node(op, ch) if op == "mul" && ch.len() >= 2 => {
            if let Expr::Val(c) = &ch[0] {
                let base = if ch.len() == 2 {
                    ch[1].clone()
                } else {
                    Expr::node("mul", ch[1..].to_vec())
                };
                (*c, base)
            } else {
                (U256::one(), term.clone())
            }
        }
        other => (U256::one(), other.clone()),
    }
}

/// Rebuild a term from `(coefficient, base)`.
fn coeff_term(coeff: U256, base: &Expr) -> Expr {
    if *base == Expr::one() {
        return Expr::Val(coeff);
    }
    if coeff == U256::one() {
        return base.clone();
    }
    Expr::node2("mul", Expr::Val(coeff), base.clone())
}

/// Decompose an expression into its constant part and the remaining terms.
pub(crate) fn split_const(e: &Expr) -> (U256, Vec<Expr>) {
    let mut konst = U256::zero();
    let mut rest = vec![];
    for t in add_terms(e) {
        if let Expr::Val(v) = t {
            konst = konst.overflowing_add(v).0;
        } else {
            rest.push(t);
        }
    }
    (konst, rest)
}

// ---------------------------------------------------------------------------
// Arithmetic operators
// ---------------------------------------------------------------------------

/// Symbolic addition: flattens nested adds, folds constants and merges
/// like terms, so `x + 2 + (-1)*x` collapses to `2`.
pub fn add_op(left: Expr, right: Expr) -> Expr {
    let mut konst = U256::zero();
    // base -> coefficient, insertion-ordered
    let mut bases: Vec<(Expr, U256)> = vec![];

    for term in add_terms(&left).into_iter().chain(add_terms(&right)) {
        let (coeff, base) = term_coeff(&term);
        if base == Expr::one() {
            konst = konst.overflowing_add(coeff).0;
            continue;
        }
        if let Some(entry) = bases.iter_mut().find(|(b, _)| *b == base) {
            entry.1 = entry.1.overflowing_add(coeff).0;
        } else {
            bases.push((base, coeff));
        }
    }

    let mut out: Vec<Expr> = vec![];
    if !konst.is_zero() {
        out.push(Expr::Val(konst));
    }
    for (base, coeff) in bases {
        if coeff.is_zero() {
            continue;
        }
        out.push(coeff_term(coeff, &base));
    }

    match out.len() {
        0 => Expr::zero(),
        1 => out.into_iter().next().unwrap_or(Expr::zero()),
        _ => Expr::node("add", out),
    }
}

/// Symbolic subtraction: `left - right`.
pub fn sub_op(left: Expr, right: Expr) -> Expr {
    add_op(left, minus_op(right))
}

/// Negate: `−exp` = `mul(-1, exp)`.
pub fn minus_op(exp: Expr) -> Expr {
    mul_op(Expr::Val(U256::MAX), exp) // -1 in two's complement
}

/// Symbolic multiplication: flattens nested muls and folds constants.
pub fn mul_op(left: Expr, right: Expr) -> Expr {
    fn mul_factors(e: &Expr) -> Vec<Expr> {
        match e {
            Expr::Node(op, ch) if op == "mul" => ch.iter().flat_map(mul_factors).collect(),
            other => vec![other.clone()],
        }
    }

    let mut konst = U256::one();
    let mut rest: Vec<Expr> = vec![];
    for f in mul_factors(&left).into_iter().chain(mul_factors(&right)) {
        if let Expr::Val(v) = f {
            konst = konst.overflowing_mul(v).0;
        } else {
            rest.push(f);
        }
    }

    if konst.is_zero() {
        return Expr::zero();
    }
    if rest.is_empty() {
        return Expr::Val(konst);
    }
    let mut out = vec![];
    if konst != U256::one() {
        out.push(Expr::Val(konst));
    }
    out.extend(rest);
    match out.len() {
        1 => out.into_iter().next().unwrap_or(Expr::one()),
        _ => Expr::node("mul", out),
    }
}

/// Symbolic exact division.  Folds only when the division is provably
/// exact (constants dividing evenly, a matching `mul` factor, or an
/// `add` whose every term divides); otherwise returns a `div` node so
/// callers can detect that no clean divisor was found.
pub fn div_op(left: Expr, right: Expr) -> Expr {
    if right == Expr::one() {
        return left;
    }
    if let Some(res) = try_div(&left, &right) {
        return res;
    }
    Expr::node2("div", left, right)
}

fn try_div(a: &Expr, b: &Expr) -> Option<Expr> {
    if a == b {
        return Some(Expr::one());
    }
    match (a, b) {
        (Expr::Val(va), Expr::Val(vb)) if !vb.is_zero() && (*va % *vb).is_zero() => {
            Some(Expr::Val(*va / *vb))
        }
        (Expr::Node(op, ch), _) if op == "mul" => {
            // Cancel a matching factor, or divide the constant coefficient.
            if let Some(pos) = ch.iter().position(|f| f == b) {
                let mut rest: Vec<Expr> = ch.clone();
                rest.remove(pos);
                return Some(match rest.len() {
                    1 => rest.into_iter().next().unwrap_or(Expr::one()),
                    _ => Expr::node("mul", rest),
                });
            }
            if let (Some(c), Some(vb)) = (ch.first().and_then(|f| f.as_val()), b.as_val()) {
                if !vb.is_zero() && (c % vb).is_zero() {
                    let mut rest = ch[1..].to_vec();
                    let folded = c / vb;
                    if folded != U256::one() {
                        rest.insert(0, Expr::Val(folded));
                    }
                    return Some(match rest.len() {
                        1 => rest.into_iter().next().unwrap_or(Expr::one()),
                        _ => Expr::node("mul", rest),
                    });
                }
            }
            None
        }
        (Expr::Node(op, ch), _) if op == "add" => {
            let divided: Option<Vec<Expr>> = ch.iter().map(|t| try_div(t, b)).collect();
            let divided = divided?;
            let mut acc = Expr::zero();
            for d in divided {
                acc = add_op(acc, d);
            }
            Some(acc)
        }
        _ => None,
    }
}

/// Symbolic mask operation: `mask_shl(size, offset, shift, val)`.
///
/// Extracts `size` bits starting at bit `offset` from `val`, then shifts
/// by `shift` (negative shifts, encoded two's complement, shift right).
pub fn mask_op(val: Expr, size: Expr, offset: Expr, shift: Expr) -> Expr {
    if let Expr::Val(s) = &size {
        if s.is_zero() {
            return Expr::zero();
        }
    }

    // Identity: (256, 0, 0, val) → val
    if let (Expr::Val(s), Expr::Val(o), Expr::Val(sh)) = (&size, &offset, &shift) {
        if *s == U256::from(256u64) && o.is_zero() && sh.is_zero() {
            return val;
        }
    }

    // Fully concrete → fold.
    if let (Some(v), Some(s), Some(o), Some(sh)) =
        (val.as_val(), size.as_u64(), offset.as_u64(), shift.as_val())
    {
        if s <= 256 && o < 256 {
            return Expr::Val(apply_mask_concrete(v, s, o, sh));
        }
    }

    Expr::node4("mask_shl", size, offset, shift, val)
}

/// Concrete evaluation of `mask_shl(size, offset, shift, val)`.
pub fn apply_mask_concrete(val: U256, size: u64, offset: u64, shift: U256) -> U256 {
    let masked = val & masks::mask_to_int(size.min(256) as u16, offset.min(255) as u16);
    if is_neg(shift) {
        let right = (U256::zero().overflowing_sub(shift).0).low_u64();
        if right >= 256 {
            U256::zero()
        } else {
            masked >> right as usize
        }
    } else {
        let left = shift.low_u64();
        if shift > U256::from(255u64) {
            U256::zero()
        } else {
            masked << left as usize
        }
    }
}

// ---------------------------------------------------------------------------
// Comparisons
// ---------------------------------------------------------------------------

/// Is the expression provably non-negative under a signed reading?
///
/// Symbolic leaves (environment reads, memory, storage, variables) are
/// word-sized unsigned quantities, so they count as non-negative.
pub fn safe_ge_zero(e: &Expr) -> Ternary {
    match e {
        Expr::Val(v) => Ternary::from_bool(!is_neg(*v)),
        Expr::Bool(_) => Ternary::True,
        Expr::Atom(_) => Ternary::True,
        Expr::Unknown => Ternary::Unknown,
        Expr::Node(op, ch) => match op.as_str() {
            "mem" | "storage" | "cd" | "var" | "sha3" | "max" | "mask_shl" | "data"
            | "balance" | "gas" | "calldatasize" | "ext_call.return_data" => Ternary::True,
            "mul" => {
                if let Some(c) = ch.first().and_then(|f| f.as_val()) {
                    if is_neg(c) {
                        // negative * (non-negative unknown) — only zero stays non-negative
                        return Ternary::Unknown;
                    }
                }
                let rest_ok = ch
                    .iter()
                    .filter(|f| !f.is_val())
                    .all(|f| safe_ge_zero(f).is_true());
                if rest_ok { Ternary::True } else { Ternary::Unknown }
            }
            "add" => {
                if ch.iter().all(|t| safe_ge_zero(t).is_true()) {
                    Ternary::True
                } else {
                    Ternary::Unknown
                }
            }
            _ => Ternary::Unknown,
        },
    }
}

/// Is the expression provably strictly positive?
fn gt_zero(e: &Expr) -> Ternary {
    match e {
        Expr::Val(v) => {
            if v.is_zero() {
                Ternary::False
            } else {
                Ternary::from_bool(!is_neg(*v))
            }
        }
        Expr::Node(op, ch) if op == "add" => {
            let all_ge = ch.iter().all(|t| safe_ge_zero(t).is_true());
            let any_gt = ch.iter().any(|t| gt_zero(t).is_true());
            if all_ge && any_gt {
                Ternary::True
            } else {
                Ternary::Unknown
            }
        }
        _ => Ternary::Unknown,
    }
}

/// Tri-state `left <= right`.  Common symbolic terms cancel, so
/// `x+32 <= x+64` decides even when `x` is unknown.
pub fn safe_le_op(left: &Expr, right: &Expr) -> Ternary {
    let diff = sub_op(right.clone(), left.clone());
    match &diff {
        Expr::Val(v) => Ternary::from_bool(!is_neg(*v)),
        _ => {
            if safe_ge_zero(&diff).is_true() {
                Ternary::True
            } else {
                // right < left iff left - right > 0
                let rev = sub_op(left.clone(), right.clone());
                if gt_zero(&rev).is_true() {
                    Ternary::False
                } else {
                    Ternary::Unknown
                }
            }
        }
    }
}

/// Tri-state `left < right`.
pub fn safe_lt_op(left: &Expr, right: &Expr) -> Ternary {
    let diff = sub_op(right.clone(), left.clone());
    match &diff {
        Expr::Val(v) => Ternary::from_bool(!v.is_zero() && !is_neg(*v)),
        _ => {
            if gt_zero(&diff).is_true() {
                Ternary::True
            } else {
                let rev = sub_op(left.clone(), right.clone());
                if safe_ge_zero(&rev).is_true() {
                    Ternary::False
                } else {
                    Ternary::Unknown
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Max / min
// ---------------------------------------------------------------------------

/// Pick the larger of two expressions when decidable.
fn max_pair(a: &Expr, b: &Expr) -> Option<Expr> {
    if a == b {
        return Some(a.clone());
    }
    if let (Expr::Val(va), Expr::Val(vb)) = (a, b) {
        return Some(if signed_le(*va, *vb) { b.clone() } else { a.clone() });
    }
    match safe_le_op(a, b) {
        Ternary::True => Some(b.clone()),
        Ternary::False => Some(a.clone()),
        Ternary::Unknown => None,
    }
}

/// Symbolic maximum: flattens nested `max` nodes, dedups, and drops
/// provably dominated arguments.
pub fn max_op(left: Expr, right: Expr) -> Expr {
    fn max_args(e: &Expr) -> Vec<Expr> {
        match e {
            Expr::Node(op, ch) if op == "max" => ch.iter().flat_map(max_args).collect(),
            other => vec![other.clone()],
        }
    }

    let mut args: Vec<Expr> = vec![];
    'outer: for cand in max_args(&left).into_iter().chain(max_args(&right)) {
        let mut i = 0;
        while i < args.len() {
            if let Some(winner) = max_pair(&args[i], &cand) {
                args[i] = winner;
                continue 'outer;
            }
            i += 1;
        }
        args.push(cand);
    }

    match args.len() {
        0 => Expr::zero(),
        1 => args.into_iter().next().unwrap_or(Expr::zero()),
        _ => Expr::node("max", args),
    }
}

/// Hoist the smallest shared constant out of a `max`:
/// `max(2+x, 3+y)` → `2 + max(x, 1+y)`.
pub fn max_to_add(e: &Expr) -> Expr {
    let args = match e {
        Expr::Node(op, ch) if op == "max" && !ch.is_empty() => ch,
        _ => return e.clone(),
    };

    let mut consts: Vec<U256> = vec![];
    for a in args {
        let (c, _) = split_const(a);
        consts.push(c);
    }
    // All arguments need a constant part with a common non-negative floor.
    if consts.iter().any(|c| c.is_zero() || is_neg(*c)) {
        return e.clone();
    }
    let min_c = consts
        .iter()
        .copied()
        .reduce(|a, b| if signed_le(a, b) { a } else { b })
        .unwrap_or_default();
    if min_c.is_zero() {
        return e.clone();
    }

    let mut shifted = args.iter().map(|a| sub_op(a.clone(), Expr::Val(min_c)));
    let mut m = match shifted.next() {
        Some(first) => first,
        None => return e.clone(),
    };
    for a in shifted {
        m = max_op(m, a);
    }
    add_op(Expr::Val(min_c), m)
}

/// Put the arguments of a `max` in a deterministic order, constants
/// first, stripping `mul(1, x)` wrappers left behind by other rewrites.
pub fn canonise_max(e: &Expr) -> Expr {
    let args = match e {
        Expr::Node(op, ch) if op == "max" => ch,
        _ => return e.clone(),
    };
    let mut args: Vec<Expr> = args
        .iter()
        .map(|a| match a {
            Expr::Node(op, ch) if op == "mul" && ch.len() == 2 && ch[0] == Expr::one() => {
                ch[1].clone()
            }
            other => other.clone(),
        })
        .collect();
    args.sort_by_key(|a| match a {
        Expr::Val(_) => format!(" {a}"),
        other => other.to_string(),
    });
    Expr::node("max", args)
}
