//! Memory location algebra.
//!
//! Provides byte-range arithmetic for the memory model.  Ranges are
//! `("range", position, length)` nodes; positions and lengths may be
//! symbolic, so every answer here is exact or explicitly `Unknown`.

use crate::core::algebra::{self, Ternary};
use crate::expr::Expr;
use primitive_types::U256;

// ===========================================================================
// Range overlap detection
// ===========================================================================

/// Extract (position, length) from a range expression.
pub fn extract_range(expr: &Expr) -> Option<(Expr, Expr)> {
    if expr.opcode() == Some("range") {
        if let Some(ch) = expr.children() {
            if ch.len() == 2 {
                return Some((ch[0].clone(), ch[1].clone()));
            }
        }
    }
    None
}

/// Tri-state check whether two memory ranges overlap.
///
/// Shared symbolic offsets cancel, so `(x+65, 32)` vs `(x+64, 32)`
/// decides even when `x` is unknown.
pub fn range_overlaps(range1: &Expr, range2: &Expr) -> Ternary {
    let (b1, l1) = match extract_range(range1) {
        Some(v) => v,
        None => return Ternary::Unknown,
    };
    let (b2, l2) = match extract_range(range2) {
        Some(v) => v,
        None => return Ternary::Unknown,
    };

    let e1 = algebra::add_op(b1.clone(), l1);
    let e2 = algebra::add_op(b2.clone(), l2);

    // Overlap iff b1 < e2 and b2 < e1.
    let c1 = algebra::safe_lt_op(&b1, &e2);
    let c2 = algebra::safe_lt_op(&b2, &e1);

    match (c1, c2) {
        (Ternary::False, _) | (_, Ternary::False) => Ternary::False,
        (Ternary::True, Ternary::True) => Ternary::True,
        _ => Ternary::Unknown,
    }
}

/// Compute surviving memory fragments after a partial overwrite.
/// Given `memloc` is the original range and `split` is the overwritten range,
/// returns the sub-ranges of `memloc` that are NOT overwritten.
///
/// When the geometry cannot be decided the whole `memloc` is returned
/// untouched; callers treat that as "possibly still live".
pub fn memloc_overwrite(memloc: &Expr, split: &Expr) -> Vec<Expr> {
    let (m_left, m_len) = match extract_range(memloc) {
        Some(v) => v,
        None => return vec![memloc.clone()],
    };
    let (s_left, s_len) = match extract_range(split) {
        Some(v) => v,
        None => return vec![memloc.clone()],
    };

    if range_overlaps(memloc, split).is_false() {
        return vec![memloc.clone()];
    }

    let m_right = algebra::add_op(m_left.clone(), m_len);
    let s_right = algebra::add_op(s_left.clone(), s_len);

    // Left fragment: [m_left, s_left).
    let left_len = algebra::sub_op(s_left, m_left.clone());
    // Right fragment: [s_right, m_right).
    let right_len = algebra::sub_op(m_right, s_right.clone());

    let mut result = Vec::new();
    for (start, len) in [(m_left, left_len), (s_right, right_len)] {
        match fragment_exists(&len) {
            Ternary::True => result.push(Expr::range(start, len)),
            Ternary::False => {}
            // Can't tell whether the fragment exists — keep the whole
            // original range alive rather than invent partial state.
            Ternary::Unknown => return vec![memloc.clone()],
        }
    }

    result
}

/// Does a fragment of the given (possibly symbolic) length exist?
fn fragment_exists(len: &Expr) -> Ternary {
    match len.as_val() {
        Some(v) => {
            // Signed reading: a "negative" length means no fragment.
            if v.is_zero() || v > (U256::one() << 255) {
                Ternary::False
            } else {
                Ternary::True
            }
        }
        None => match algebra::safe_lt_op(&Expr::zero(), len) {
            Ternary::True => Ternary::True,
            Ternary::False => Ternary::False,
            Ternary::Unknown => Ternary::Unknown,
        },
    }
}

/// Split a forwarded write into surviving (range, value-slice) pairs after a
/// later write clobbers part of it.
///
/// `memloc`/`mem_val` describe the write being forwarded, `split` the
/// clobbering range.  Returns `None` when the slices cannot be computed
/// exactly (the caller then stops forwarding altogether).
pub fn splits_mem(memloc: &Expr, split: &Expr, mem_val: &Expr) -> Option<Vec<(Expr, Expr)>> {
    let (m_left, m_len) = extract_range(memloc)?;
    let fragments = memloc_overwrite(memloc, split);

    // memloc_overwrite returning the untouched original means "undecided".
    if fragments.len() == 1 && fragments[0] == *memloc {
        return None;
    }

    let m_len_v = m_len.as_val()?;
    let mut out = vec![];
    for frag in fragments {
        let (f_left, f_len) = extract_range(&frag)?;
        // Byte offset of the fragment within the original write.
        let off = algebra::sub_op(f_left.clone(), m_left.clone()).as_val()?;
        let f_len_v = f_len.as_val()?;
        if off + f_len_v > m_len_v {
            return None;
        }
        let slice = slice_bytes(mem_val, m_len_v, off, f_len_v);
        out.push((frag, slice));
    }
    Some(out)
}

/// Extract bytes `[off, off+len)` of a `total`-byte big-endian value.
fn slice_bytes(val: &Expr, total: U256, off: U256, len: U256) -> Expr {
    let tail = total - off - len; // bytes to the right of the slice
    let tail_bits = Expr::Val(tail * U256::from(8u64));
    let neg_tail_bits = algebra::minus_op(tail_bits.clone());
    algebra::mask_op(
        val.clone(),
        Expr::Val(len * U256::from(8u64)),
        tail_bits,
        neg_tail_bits,
    )
}

/// Substitute a known memory write into a memory read.
///
/// Exact range match returns the written value; a read fully contained in
/// the write (with concrete relative offsets) returns the matching byte
/// slice; anything else is left untouched.
pub fn fill_mem(read_expr: &Expr, write_range: &Expr, write_val: &Expr) -> Expr {
    let rch = match read_expr.children() {
        Some(ch) if read_expr.opcode() == Some("mem") && ch.len() == 1 => ch,
        _ => return read_expr.clone(),
    };
    let read_range = &rch[0];
    if read_range == write_range {
        return write_val.clone();
    }

    let (rb, rl) = match extract_range(read_range) {
        Some(v) => v,
        None => return read_expr.clone(),
    };
    let (wb, wl) = match extract_range(write_range) {
        Some(v) => v,
        None => return read_expr.clone(),
    };

    // Containment with concrete relative geometry.
    let off = match algebra::sub_op(rb, wb).as_val() {
        Some(v) if v <= (U256::one() << 255) => v,
        _ => return read_expr.clone(),
    };
    let (rl_v, wl_v) = match (rl.as_val(), wl.as_val()) {
        (Some(a), Some(b)) => (a, b),
        _ => return read_expr.clone(),
    };
    if off + rl_v > wl_v {
        return read_expr.clone();
    }

    slice_bytes(write_val, wl_v, off, rl_v)
}

/// Apply a bit mask to a memory range, producing a sub-range.
/// In EVM's big-endian memory model, low offset bits correspond to rightmost bytes.
pub fn apply_mask_to_range(memloc: &Expr, size_bits: u64, offset_bits: u64) -> Option<Expr> {
    let (pos, len) = extract_range(memloc)?;
    let len_val = len.as_val()?;

    if size_bits % 8 != 0 || offset_bits % 8 != 0 {
        return None; // Not byte-aligned.
    }
    let size_bytes = size_bits / 8;
    let offset_bytes = offset_bits / 8;

    let total = size_bytes + offset_bytes;
    if U256::from(total) > len_val {
        return None; // Mask doesn't fit in range.
    }

    // Big-endian: low offset = rightmost bytes.
    let new_pos = algebra::add_op(pos, Expr::Val(len_val - U256::from(total)));
    Some(Expr::range(new_pos, Expr::val(size_bytes)))
}

/// Decompose an `or(mask_shl(...), ...)` value into (size_bits, offset_bits,
/// value) triples, sorted by offset.  Values are right-aligned: the triple's
/// value holds the window's content in its low `size` bits.
pub fn split_or(value: &Expr) -> Vec<(u64, u64, Expr)> {
    match value.opcode() {
        Some("or") => {
            if let Some(ch) = value.children() {
                let mut result = Vec::new();
                for term in ch {
                    if let Some(components) = extract_mask_shl(term) {
                        result.push(components);
                    } else if let Some(v) = term.as_val() {
                        // Concrete value — find its bit range.
                        if v.is_zero() {
                            continue;
                        }
                        let (size, offset) = find_bit_range(v);
                        result.push((size, offset, Expr::Val(v >> offset as usize)));
                    } else if term.opcode() == Some("storage") {
                        if let Some(sch) = term.children() {
                            let size = sch.first().and_then(|e| e.as_u64()).unwrap_or(256);
                            result.push((size, 0, term.clone()));
                        }
                    } else {
                        result.push((256, 0, term.clone()));
                    }
                }
                // Sort by offset.
                result.sort_by_key(|(_, off, _)| *off);
                return result;
            }
        }
        Some("mask_shl") => {
            if let Some(c) = extract_mask_shl(value) {
                return vec![c];
            }
        }
        _ => {}
    }

    vec![(256, 0, value.clone())]
}

/// Extract (size, offset, value) from a mask_shl expression with a
/// concrete window.  The window sits at `mask offset + shift` in the word;
/// the returned value is its content right-aligned.
fn extract_mask_shl(expr: &Expr) -> Option<(u64, u64, Expr)> {
    if expr.opcode() == Some("mask_shl") {
        if let Some(ch) = expr.children() {
            if ch.len() == 4 {
                let size = ch[0].as_u64()?;
                let offset = ch[1].as_u64()?;
                let shl = ch[2].as_signed()?;
                let window = offset as i128 + shl;
                if window < 0 || window as u64 + size > 256 {
                    return None;
                }
                let aligned = if offset == 0 {
                    algebra::mask_op(
                        ch[3].clone(),
                        Expr::val(size),
                        Expr::zero(),
                        Expr::zero(),
                    )
                } else {
                    algebra::mask_op(
                        ch[3].clone(),
                        Expr::val(size),
                        Expr::val(offset),
                        algebra::minus_op(Expr::val(offset)),
                    )
                };
                return Some((size, window as u64, aligned));
            }
        }
    }
    None
}

/// Find the bit range occupied by a concrete value: (size, offset).
fn find_bit_range(val: U256) -> (u64, u64) {
    if val.is_zero() {
        return (0, 0);
    }
    let mut low = 0u64;
    let mut high = 0u64;
    let mut seen = false;
    for i in 0..256 {
        if val.bit(i) {
            if !seen {
                low = i as u64;
                seen = true;
            }
            high = i as u64 + 1;
        }
    }
    (high - low, low)
}
