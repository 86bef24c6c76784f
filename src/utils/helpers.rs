//! General traversal helpers shared by all passes.

use crate::expr::Expr;

/// Check if `num` is a power of 2 and return the exponent.
pub fn to_exp2(num: primitive_types::U256) -> Option<u16> {
    if num.is_zero() || num == primitive_types::U256::one() {
        if num == primitive_types::U256::one() {
            return Some(0);
        }
        return None;
    }
    // Check single-bit
    let mut n = num;
    let mut count = 0u16;
    while !n.is_zero() {
        if n.low_u64() & 1 == 1 {
            if n == primitive_types::U256::one() {
                return Some(count);
            }
            return None;
        }
        n >>= 1;
        count += 1;
    }
    None
}

/// Recursively apply function `f` to every sub-expression, bottom-up.
pub fn replace_f(expr: &Expr, f: &dyn Fn(&Expr) -> Expr) -> Expr {
    let transformed = match expr {
        Expr::Node(op, children) => {
            let new_children: Vec<Expr> = children.iter().map(|c| replace_f(c, f)).collect();
            Expr::Node(op.clone(), new_children)
        }
        other => other.clone(),
    };
    f(&transformed)
}

/// Extract the line list from a `seq` node (empty for anything else).
pub fn extract_seq(expr: &Expr) -> Vec<Expr> {
    if expr.opcode() == Some("seq") {
        expr.children().map(|ch| ch.to_vec()).unwrap_or_default()
    } else {
        vec![]
    }
}

/// Rewrite every line of a trace using function `f`.
/// `f` returns a Vec<Expr> (0 = remove, 1 = keep/replace, >1 = expand).
/// Recurses into if/while sub-traces.
pub fn rewrite_trace(trace: &[Expr], f: &dyn Fn(&Expr) -> Vec<Expr>) -> Vec<Expr> {
    let mut result = Vec::new();
    for line in trace {
        match line.opcode() {
            Some("if") => {
                if let Some(ch) = line.children() {
                    let cond = ch.first().cloned().unwrap_or(Expr::zero());
                    let if_true = ch
                        .get(1)
                        .and_then(|e| e.children())
                        .map(|c| rewrite_trace(c, f))
                        .unwrap_or_default();
                    let if_false = ch
                        .get(2)
                        .and_then(|e| e.children())
                        .map(|c| rewrite_trace(c, f))
                        .unwrap_or_default();
                    result.push(Expr::node3(
                        "if",
                        cond,
                        Expr::node("seq", if_true),
                        Expr::node("seq", if_false),
                    ));
                }
            }
            Some("while") => {
                if let Some(ch) = line.children() {
                    let cond = ch.first().cloned().unwrap_or(Expr::zero());
                    let body = ch
                        .get(1)
                        .and_then(|e| e.children())
                        .map(|c| rewrite_trace(c, f))
                        .unwrap_or_default();
                    let rest: Vec<Expr> = ch[2..].to_vec();
                    let mut new_ch = vec![cond, Expr::node("seq", body)];
                    new_ch.extend(rest);
                    result.push(Expr::Node("while".to_string(), new_ch));
                }
            }
            _ => {
                result.extend(f(line));
            }
        }
    }
    result
}
