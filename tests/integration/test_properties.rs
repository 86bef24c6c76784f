//! Property tests: simplification preserves value modulo 2^256 and is
//! idempotent.

use lapidary::core::algebra::apply_mask_concrete;
use lapidary::expr::Expr;
use lapidary::simplify::Simplifier;
use primitive_types::U256;
use proptest::prelude::*;

/// Every rewriting rule for these ops is exact mod 2^256.
const OPS: &[&str] = &["add", "mul", "and", "or", "xor"];

fn arb_expr(ops: &'static [&'static str]) -> impl Strategy<Value = Expr> {
    let leaf = prop_oneof![
        any::<u64>().prop_map(Expr::val),
        Just(Expr::atom("x")),
    ];
    leaf.prop_recursive(3, 32, 3, move |inner| {
        (
            proptest::sample::select(ops),
            proptest::collection::vec(inner, 2..=3),
        )
            .prop_map(|(op, ch)| Expr::node(op, ch))
    })
}

/// Reference evaluator with the atom `x` bound to a concrete value.
fn eval(e: &Expr, x: U256) -> U256 {
    match e {
        Expr::Val(v) => *v,
        Expr::Atom(_) => x,
        Expr::Bool(b) => U256::from(*b as u8),
        Expr::Unknown => U256::zero(),
        Expr::Node(op, ch) => {
            let args: Vec<U256> = ch.iter().map(|c| eval(c, x)).collect();
            match op.as_str() {
                "add" => args
                    .iter()
                    .fold(U256::zero(), |a, b| a.overflowing_add(*b).0),
                "mul" => args
                    .iter()
                    .fold(U256::one(), |a, b| a.overflowing_mul(*b).0),
                "and" => args.iter().fold(U256::MAX, |a, b| a & *b),
                "or" => args.iter().fold(U256::zero(), |a, b| a | *b),
                "xor" => args.iter().fold(U256::zero(), |a, b| a ^ *b),
                "mask_shl" => apply_mask_concrete(
                    args[3],
                    args[0].low_u64(),
                    args[1].low_u64(),
                    args[2],
                ),
                other => panic!("evaluator has no rule for {other}"),
            }
        }
    }
}

proptest! {
    #[test]
    fn prop_simplification_preserves_value(
        e in arb_expr(OPS),
        x in any::<u64>(),
    ) {
        let x = U256::from(x);
        let simplified = Simplifier::new().exp(&e);
        prop_assert_eq!(eval(&simplified, x), eval(&e, x), "input: {}", e);
    }

    #[test]
    fn prop_concrete_trees_fold_completely(e in arb_expr(OPS)) {
        // Without the symbolic leaf everything must fold to a single value.
        let concrete = e.replace(&Expr::atom("x"), &Expr::val(0x1234));
        let simplified = Simplifier::new().exp(&concrete);
        prop_assert!(simplified.is_val(), "did not fold: {} -> {}", concrete, simplified);
    }

    #[test]
    fn prop_simplification_is_idempotent(e in arb_expr(OPS)) {
        let s = Simplifier::new();
        let once = s.exp(&e);
        let twice = s.exp(&once);
        prop_assert_eq!(&once, &twice, "not a fixed point: {}", e);
    }
}
