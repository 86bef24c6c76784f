//! Rewriting-rule tests for the expression simplifier.

use lapidary::expr::Expr;
use lapidary::simplify::{sizeof_exp, Simplifier};
use primitive_types::U256;

fn simp(e: &Expr) -> Expr {
    Simplifier::new().exp(e)
}

fn mask(size: u64, offset: u64, shl: i64, val: Expr) -> Expr {
    Expr::node4(
        "mask_shl",
        Expr::val(size),
        Expr::val(offset),
        Expr::val_i64(shl),
        val,
    )
}

#[test]
fn test_iszero_drops_lossless_shift() {
    // Shifting left cannot zero a value when the window still fits,
    // so the truth test ignores the shift.
    let x = Expr::atom("x");
    let e = Expr::node1("iszero", mask(96, 0, 160, x.clone()));
    assert_eq!(simp(&e), Expr::node1("iszero", mask(96, 0, 0, x)));
}

#[test]
fn test_iszero_concrete() {
    assert_eq!(simp(&Expr::node1("iszero", Expr::zero())), Expr::val(1));
    assert_eq!(simp(&Expr::node1("iszero", Expr::val(7))), Expr::zero());
}

#[test]
fn test_bool_collapses_boolish_children() {
    let c = Expr::atom("c");
    let already = Expr::node1("iszero", c.clone());
    assert_eq!(simp(&Expr::node1("bool", already.clone())), already);
    assert_eq!(simp(&Expr::node1("bool", Expr::val(42))), Expr::val(1));
}

#[test]
fn test_eq_same_operands() {
    let x = Expr::atom("x");
    assert_eq!(simp(&Expr::node2("eq", x.clone(), x)), Expr::val(1));
    assert_eq!(
        simp(&Expr::node2("eq", Expr::val(3), Expr::val(4))),
        Expr::zero()
    );
}

#[test]
fn test_not_fold() {
    assert_eq!(
        simp(&Expr::node1("not", Expr::zero())),
        Expr::Val(U256::MAX)
    );
}

#[test]
fn test_div_by_power_of_two() {
    let x = Expr::atom("x");
    let e = Expr::node2("div", x.clone(), Expr::val(32));
    assert_eq!(simp(&e), mask(251, 5, -5, x));
}

#[test]
fn test_div_concrete_and_by_one() {
    assert_eq!(
        simp(&Expr::node2("div", Expr::val(100), Expr::val(7))),
        Expr::val(14)
    );
    let x = Expr::atom("x");
    assert_eq!(simp(&Expr::node2("div", x.clone(), Expr::val(1))), x);
}

#[test]
fn test_shr_becomes_mask() {
    let x = Expr::atom("x");
    let e = Expr::node2("shr", Expr::val(96), x.clone());
    assert_eq!(simp(&e), mask(160, 96, -96, x));
}

#[test]
fn test_xor_self_is_zero() {
    let x = Expr::atom("x");
    assert_eq!(simp(&Expr::node2("xor", x.clone(), x)), Expr::zero());
}

#[test]
fn test_and_with_extremes() {
    let x = Expr::atom("x");
    assert_eq!(
        simp(&Expr::node2("and", x.clone(), Expr::zero())),
        Expr::zero()
    );
    assert_eq!(simp(&Expr::node2("and", Expr::Val(U256::MAX), x.clone())), x);
}

#[test]
fn test_or_merges_constants() {
    let x = Expr::atom("x");
    let e = Expr::node("or", vec![Expr::val(0xf0), x.clone(), Expr::val(0x0f)]);
    assert_eq!(simp(&e), Expr::node2("or", Expr::val(0xff), x));
}

#[test]
fn test_or_keeps_disjoint_high_window() {
    // The high window's bits are live even when the other operand fits
    // entirely below it; dropping them would change the value.
    let x = Expr::atom("x");
    let e = Expr::node2("or", Expr::one(), mask(8, 8, 0, x.clone()));
    assert_eq!(simp(&e), Expr::node2("or", Expr::one(), mask(8, 8, 0, x)));
}

#[test]
fn test_and_neg_mask_clears_low_bits() {
    // and(not(31), x) is the word-alignment idiom.
    let x = Expr::atom("x");
    let e = Expr::node2("and", Expr::Val(!U256::from(31u64)), x.clone());
    assert_eq!(simp(&e), mask(251, 5, 0, x));
}

#[test]
fn test_signed_compare_folds_full_width() {
    // 2^200 is positive under a signed reading.
    let big = Expr::Val(U256::one() << 200);
    assert_eq!(simp(&Expr::node2("slt", big.clone(), Expr::one())), Expr::zero());
    assert_eq!(simp(&Expr::node2("sgt", big, Expr::one())), Expr::val(1));
}

#[test]
fn test_address_atom_collapses_mask() {
    let e = mask(160, 0, 0, Expr::atom("caller"));
    assert_eq!(simp(&e), Expr::atom("caller"));
}

#[test]
fn test_storage_passthrough() {
    let st = Expr::node3("storage", Expr::val(160), Expr::val(0), Expr::val(3));
    let e = mask(256, 0, 0, st.clone());
    assert_eq!(simp(&e), st);
}

#[test]
fn test_nested_masks_take_min_size() {
    // Re-masking an already masked value keeps the narrower window.
    let x = Expr::atom("x");
    let e = mask(64, 0, 0, mask(160, 0, 0, x.clone()));
    assert_eq!(simp(&e), mask(64, 0, 0, x));
}

#[test]
fn test_mask_reselecting_shifted_window_is_dropped() {
    // The outer mask selects exactly the bits the inner shift placed
    // there; the value keeps its in-word position.
    let x = Expr::atom("x");
    let e = mask(160, 96, 0, mask(160, 0, 96, x.clone()));
    assert_eq!(simp(&e), mask(160, 0, 96, x));
}

#[test]
fn test_mask_over_mem_with_offset_keeps_position() {
    // Selecting bits 160..256 of a 32-byte read narrows to the first 12
    // bytes, then shifts them back into place.
    let e = mask(96, 160, 0, Expr::mem(Expr::val(64), Expr::val(32)));
    assert_eq!(
        simp(&e),
        mask(96, 0, 160, Expr::mem(Expr::val(64), Expr::val(12)))
    );
}

#[test]
fn test_mem_of_empty_range() {
    let e = Expr::mem(Expr::val(64), Expr::val(0));
    assert_eq!(simp(&e), Expr::zero());
}

#[test]
fn test_mask_concrete_fold() {
    // Low byte of 0xabcd.
    let e = mask(8, 0, 0, Expr::val(0xabcd));
    assert_eq!(simp(&e), Expr::val(0xcd));
}

#[test]
fn test_max_fold() {
    assert_eq!(
        simp(&Expr::node2("max", Expr::val(96), Expr::val(64))),
        Expr::val(96)
    );
    let x = Expr::atom("x");
    assert_eq!(simp(&Expr::node1("max", x.clone())), x);
}

#[test]
fn test_signextend_and_byte_fold() {
    // signextend(0, 0xff) reads byte 0 as a signed i8: -1.
    assert_eq!(
        simp(&Expr::node2("signextend", Expr::zero(), Expr::val(0xff))),
        Expr::Val(U256::MAX)
    );
    // byte 31 is the least significant one.
    assert_eq!(
        simp(&Expr::node2("byte", Expr::val(31), Expr::val(0x1234))),
        Expr::val(0x34)
    );
}

#[test]
fn test_mul_double_negation() {
    let x = Expr::atom("x");
    let neg = Expr::node2("mul", Expr::Val(U256::MAX), x.clone());
    let e = Expr::node2("mul", Expr::Val(U256::MAX), neg);
    assert_eq!(simp(&e), x);
}

#[test]
fn test_deep_tree_folds_bottom_up() {
    // iszero(eq(add(2, 3), 5)) → iszero(1) → 0
    let e = Expr::node1(
        "iszero",
        Expr::node2(
            "eq",
            Expr::node2("add", Expr::val(2), Expr::val(3)),
            Expr::val(5),
        ),
    );
    assert_eq!(simp(&e), Expr::zero());
}

#[test]
fn test_mask_over_data_trims_left_and_right() {
    // data(a, b, c) of three full words; the middle 256-bit window keeps
    // only b.
    let a = Expr::node3("storage", Expr::val(256), Expr::val(0), Expr::val(1));
    let b = Expr::node3("storage", Expr::val(256), Expr::val(0), Expr::val(2));
    let c = Expr::node3("storage", Expr::val(256), Expr::val(0), Expr::val(3));
    let e = mask(256, 256, 0, Expr::node3("data", a, b.clone(), c));
    assert_eq!(simp(&e), b);
}

#[test]
fn test_sizeof_exp_data_sum() {
    let d = Expr::node2(
        "data",
        mask(160, 0, 96, Expr::atom("x")),
        Expr::mem(Expr::val(0), Expr::val(12)),
    );
    assert_eq!(sizeof_exp(&d), Some(352));
}

#[test]
fn test_simplifier_reuse_across_expressions() {
    // One engine over many expressions; later queries hit the memo cache
    // and must agree with fresh computation.
    let s = Simplifier::new();
    let e = Expr::node2(
        "add",
        Expr::atom("x"),
        Expr::node2("mul", Expr::val(2), Expr::val(8)),
    );
    let first = s.exp(&e);
    let second = s.exp(&e);
    assert_eq!(first, second);
    assert_eq!(first, Simplifier::new().exp(&e));
}
