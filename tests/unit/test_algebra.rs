//! Term-level algebra tests.

use lapidary::core::algebra::*;
use lapidary::core::Ternary;
use lapidary::expr::Expr;
use primitive_types::U256;

#[test]
fn test_add_op_folds_constants() {
    assert_eq!(add_op(Expr::val(2), Expr::val(3)), Expr::val(5));
    // Wrap-around at 2^256.
    let max = Expr::Val(U256::MAX);
    assert_eq!(add_op(max, Expr::val(1)), Expr::zero());
}

#[test]
fn test_add_op_merges_coefficients() {
    let x = Expr::atom("x");
    // 2x + 3x = 5x
    let two_x = mul_op(Expr::val(2), x.clone());
    let three_x = mul_op(Expr::val(3), x.clone());
    assert_eq!(add_op(two_x, three_x), mul_op(Expr::val(5), x.clone()));
    // x + (-1)*x = 0
    assert_eq!(add_op(x.clone(), minus_op(x)), Expr::zero());
}

#[test]
fn test_sub_op_cancels() {
    let x = Expr::atom("x");
    let sum = add_op(Expr::val(64), x.clone());
    assert_eq!(sub_op(sum, x), Expr::val(64));
}

#[test]
fn test_div_op_exact_only() {
    let x = Expr::atom("x");
    // (32 * x) / 32 = x
    assert_eq!(div_op(mul_op(Expr::val(32), x.clone()), Expr::val(32)), x);
    // 96 / 32 = 3
    assert_eq!(div_op(Expr::val(96), Expr::val(32)), Expr::val(3));
    // 97 / 32 stays a div node.
    assert!(div_op(Expr::val(97), Expr::val(32)).contains_op("div"));
    // x / x = 1
    let y = Expr::atom("y");
    assert_eq!(div_op(y.clone(), y), Expr::one());
}

#[test]
fn test_mask_op_concrete_fold() {
    // Low byte of 0x1234 is 0x34.
    let r = mask_op(Expr::val(0x1234), Expr::val(8), Expr::zero(), Expr::zero());
    assert_eq!(r, Expr::val(0x34));
    // Identity mask.
    let x = Expr::atom("x");
    let id = mask_op(x.clone(), Expr::val(256), Expr::zero(), Expr::zero());
    assert_eq!(id, x);
}

#[test]
fn test_safe_ge_zero() {
    assert_eq!(safe_ge_zero(&Expr::val(5)), Ternary::True);
    assert_eq!(safe_ge_zero(&Expr::Val(U256::MAX)), Ternary::False);
    // Memory reads and calldata are unsigned quantities.
    assert_eq!(
        safe_ge_zero(&Expr::mem(Expr::val(0), Expr::val(32))),
        Ternary::True
    );
    // x - y could be anything.
    let diff = sub_op(Expr::atom("x"), Expr::atom("y"));
    assert_eq!(safe_ge_zero(&diff), Ternary::Unknown);
}

#[test]
fn test_safe_le_op_symbolic_cancellation() {
    let x = Expr::atom("x");
    let a = add_op(x.clone(), Expr::val(4));
    let b = add_op(x.clone(), Expr::val(64));
    assert_eq!(safe_le_op(&a, &b), Ternary::True);
    assert_eq!(safe_le_op(&b, &a), Ternary::False);
    assert_eq!(safe_le_op(&x, &Expr::atom("y")), Ternary::Unknown);
}

#[test]
fn test_safe_lt_op_strict() {
    let x = Expr::atom("x");
    assert_eq!(safe_lt_op(&x, &x), Ternary::False);
    assert_eq!(
        safe_lt_op(&x, &add_op(x.clone(), Expr::val(1))),
        Ternary::True
    );
}

#[test]
fn test_max_op_dominance() {
    let x = Expr::atom("x");
    // max(x, x) = x
    assert_eq!(max_op(x.clone(), x.clone()), x);
    // max(4, 64) = 64
    assert_eq!(max_op(Expr::val(4), Expr::val(64)), Expr::val(64));
    // max(x, x + 32) = x + 32
    let bigger = add_op(x.clone(), Expr::val(32));
    assert_eq!(max_op(x.clone(), bigger.clone()), bigger);
}

#[test]
fn test_max_to_add_hoists_smallest_constant() {
    let x = Expr::atom("x");
    // max(4, 64 + x) with x >= 0: hoist 4 → 4 + max(0, 60 + x)
    let m = Expr::node2("max", Expr::val(4), add_op(Expr::val(64), x.clone()));
    let r = max_to_add(&m);
    assert!(r.opcode() == Some("add"), "expected add at top: {r}");
    assert!(r.contains(&Expr::val(4)) || r.contains_op("max"));
}

#[test]
fn test_minus_op_round_trip() {
    let x = Expr::atom("x");
    assert_eq!(minus_op(minus_op(x.clone())), x);
    assert_eq!(add_op(Expr::val(10), minus_op(Expr::val(3))), Expr::val(7));
}

#[test]
fn test_ternary_not() {
    assert_eq!(Ternary::True.not(), Ternary::False);
    assert_eq!(Ternary::False.not(), Ternary::True);
    assert_eq!(Ternary::Unknown.not(), Ternary::Unknown);
}
