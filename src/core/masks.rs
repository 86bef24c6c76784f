//! Bitmask decomposition helpers.
//!
//! The simplifier canonicalises `and`/`shl`/`shr`/`div`/`mul`-by-powers-of-2
//! into `mask_shl` nodes; these functions recognise contiguous masks in
//! concrete words.

use primitive_types::U256;

/// Extract bit at position `pos` from `num`.
fn get_bit(num: U256, pos: u16) -> u8 {
    if num.bit(pos as usize) { 1 } else { 0 }
}

/// Compute `(2^size - 1) * 2^offset` — the integer mask.
pub fn mask_to_int(size: u16, offset: u16) -> U256 {
    if size == 0 {
        return U256::zero();
    }
    if size >= 256 {
        if offset == 0 {
            return U256::MAX;
        }
        return U256::MAX << offset as usize;
    }
    let mask = (U256::one() << size as usize) - U256::one();
    mask << offset as usize
}

/// Try to decompose `num` into a contiguous bitmask: returns `(size, offset)`
/// such that `num == mask_to_int(size, offset)`, or `None` if `num` is not a
/// contiguous mask.
pub fn to_mask(num: U256) -> Option<(u16, u16)> {
    if num.is_zero() {
        return Some((0, 0));
    }

    let mut i: u16 = 0;
    while i < 256 && get_bit(num, i) == 0 {
        i += 1;
    }
    let mask_pos = i;

    while i < 256 && get_bit(num, i) == 1 {
        i += 1;
    }
    let mask_pos_plus_len = i;

    while i < 256 {
        if get_bit(num, i) != 0 {
            return None;
        }
        i += 1;
    }

    Some((mask_pos_plus_len - mask_pos, mask_pos))
}

/// Decompose `num` as a negative mask (complement of a contiguous range).
pub fn to_neg_mask(num: U256) -> Option<(u16, u16)> {
    let mut i: u16 = 0;
    while i < 256 && get_bit(num, i) == 1 {
        i += 1;
    }
    let mask_pos = i;

    while i < 256 && get_bit(num, i) == 0 {
        i += 1;
    }
    let mask_pos_plus_len = i;

    while i < 256 {
        if get_bit(num, i) != 1 {
            return None;
        }
        i += 1;
    }

    Some((mask_pos_plus_len - mask_pos, mask_pos))
}
