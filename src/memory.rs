//! Memory write forwarding and dead store elimination.
//!
//! `setmem` lines are propagated forward through the trace: reads of the
//! written location are replaced by the written value, with partial reads
//! resolved through byte slicing.  Forwarding stops conservatively at any
//! point where the tracked location, or the expressions it depends on,
//! might change in a way we cannot prove safe.

use crate::core::memloc::{self, range_overlaps};
use crate::core::Ternary;
use crate::expr::{Expr, Trace};
use crate::utils::helpers::extract_seq;

/// One pass of memory forwarding over a trace.
///
/// For every `setmem`, reads of its location in the rest of the trace are
/// replaced by the written value where that is provably correct.  A write
/// whose location is never read afterwards is dropped as a dead store.
pub fn cleanup_mems(trace: &[Expr]) -> Trace {
    let mut result = Trace::new();

    for (idx, line) in trace.iter().enumerate() {
        if line.opcode() == Some("setmem") {
            if let Some(ch) = line.children() {
                if ch.len() == 2 {
                    let mem_id = &ch[0];
                    let mem_val = &ch[1];

                    // setmem(r, mem(r)) is a no-op.
                    if *mem_val == Expr::node1("mem", mem_id.clone()) {
                        result.extend(cleanup_mems(&trace[idx + 1..]));
                        return result;
                    }

                    let remaining = &trace[idx + 1..];

                    // A value that itself reads memory cannot be forwarded
                    // textually; later writes would silently change it.
                    if exp_reads_mem(mem_val) {
                        result.push(line.clone());
                        result.extend(cleanup_mems(remaining));
                        return result;
                    }

                    let substituted = replace_mem(remaining, mem_id, mem_val, false);

                    if trace_uses_mem(&substituted, mem_id) {
                        result.push(line.clone());
                    }

                    result.extend(cleanup_mems(&substituted));
                    return result;
                }
            }
        }

        match line.opcode() {
            Some("if") => {
                if let Some(ch) = line.children() {
                    let cond = ch.first().cloned().unwrap_or(Expr::zero());
                    let if_true = ch.get(1).map(extract_seq).unwrap_or_default();
                    let if_false = ch.get(2).map(extract_seq).unwrap_or_default();
                    result.push(Expr::node3(
                        "if",
                        cond,
                        Expr::node("seq", cleanup_mems(&if_true)),
                        Expr::node("seq", cleanup_mems(&if_false)),
                    ));
                }
            }
            Some("while") => {
                if let Some(ch) = line.children() {
                    let cond = ch.first().cloned().unwrap_or(Expr::zero());
                    let body = ch.get(1).map(extract_seq).unwrap_or_default();
                    let rest: Vec<Expr> = if ch.len() > 2 { ch[2..].to_vec() } else { vec![] };
                    let mut new_ch = vec![cond, Expr::node("seq", cleanup_mems(&body))];
                    new_ch.extend(rest);
                    result.push(Expr::Node("while".to_string(), new_ch));
                }
            }
            _ => result.push(line.clone()),
        }
    }

    result
}

/// Forward `mem(mem_id) == mem_val` through a trace.
///
/// Stops (leaving the rest of the trace untouched) whenever a line might
/// invalidate the equation: an overlapping write with undecidable geometry,
/// a `setvar` feeding the tracked expressions, or a loop that touches the
/// location.  Overlapping writes with concrete geometry split the tracked
/// location into surviving fragments that keep being forwarded.
pub fn replace_mem(trace: &[Expr], mem_id: &Expr, mem_val: &Expr, in_loop: bool) -> Trace {
    let mut result = Trace::new();

    for (idx, line) in trace.iter().enumerate() {
        if line.opcode() == Some("setmem") {
            if let Some(ch) = line.children() {
                if ch.len() == 2 {
                    // Resolve reads inside the write itself first, so that
                    // setmem(range(mem(range(64, 32)), 32), ..) sees the
                    // forwarded offset before the overlap check.
                    let write_range = replace_mem_exp(&ch[0], mem_id, mem_val);
                    let write_val = replace_mem_exp(&ch[1], mem_id, mem_val);
                    let new_line = Expr::node2("setmem", write_range.clone(), write_val);

                    match range_overlaps(&write_range, mem_id) {
                        Ternary::False => {
                            result.push(new_line);
                            continue;
                        }
                        _ => {
                            result.push(new_line);
                            let rest = &trace[idx + 1..];
                            match memloc::splits_mem(mem_id, &write_range, mem_val) {
                                Some(fragments) => {
                                    let mut remaining = rest.to_vec();
                                    for (frag_id, frag_val) in fragments {
                                        remaining =
                                            replace_mem(&remaining, &frag_id, &frag_val, in_loop);
                                    }
                                    result.extend(remaining);
                                }
                                None => result.extend(rest.to_vec()),
                            }
                            return result;
                        }
                    }
                }
            }
        }

        // setvar to a variable the tracked expressions depend on.
        if affects(line, mem_id) || affects(line, mem_val) {
            result.push(line.clone());
            result.extend(trace[idx + 1..].to_vec());
            return result;
        }

        match line.opcode() {
            Some("if") => {
                if let Some(ch) = line.children() {
                    let cond = replace_mem_exp(
                        &ch.first().cloned().unwrap_or(Expr::zero()),
                        mem_id,
                        mem_val,
                    );
                    let if_true = ch.get(1).map(extract_seq).unwrap_or_default();
                    let if_false = ch.get(2).map(extract_seq).unwrap_or_default();
                    let new_true = replace_mem(&if_true, mem_id, mem_val, in_loop);
                    let new_false = replace_mem(&if_false, mem_id, mem_val, in_loop);
                    let clobbers = trace_affects_mem(&new_true, mem_id)
                        || trace_affects_mem(&new_false, mem_id);
                    result.push(Expr::node3(
                        "if",
                        cond,
                        Expr::node("seq", new_true),
                        Expr::node("seq", new_false),
                    ));
                    // A branch that may rewrite the location invalidates the
                    // equation for everything after the if.
                    if clobbers {
                        result.extend(trace[idx + 1..].to_vec());
                        return result;
                    }
                }
            }
            Some("while") => {
                if let Some(ch) = line.children() {
                    let body = ch.get(1).map(extract_seq).unwrap_or_default();
                    let touches = trace_affects_mem(&body, mem_id)
                        || body.iter().any(|l| affects(l, mem_id) || affects(l, mem_val));

                    // Loop entry assignments run exactly once and always see
                    // the pre-loop memory, so they are always rewritten.
                    let mut new_ch: Vec<Expr> = Vec::with_capacity(ch.len());
                    if touches {
                        new_ch.push(ch[0].clone());
                        new_ch.push(ch[1].clone());
                        if ch.len() > 2 {
                            new_ch.push(ch[2].clone());
                        }
                        for sv in ch.iter().skip(3) {
                            new_ch.push(replace_mem_exp(sv, mem_id, mem_val));
                        }
                        result.push(Expr::Node("while".to_string(), new_ch));
                        result.extend(trace[idx + 1..].to_vec());
                        return result;
                    }

                    new_ch.push(replace_mem_exp(&ch[0], mem_id, mem_val));
                    new_ch.push(Expr::node("seq", replace_mem(&body, mem_id, mem_val, true)));
                    if ch.len() > 2 {
                        new_ch.push(ch[2].clone());
                    }
                    for sv in ch.iter().skip(3) {
                        new_ch.push(replace_mem_exp(sv, mem_id, mem_val));
                    }
                    result.push(Expr::Node("while".to_string(), new_ch));
                }
            }
            _ => {
                result.push(replace_mem_exp(line, mem_id, mem_val));
            }
        }
    }

    result
}

/// Replace reads of `mem_id` inside one expression.
///
/// Every `mem` node goes through [`memloc::fill_mem`], which resolves exact
/// matches and concrete sub-range reads.  Contiguous memory arguments of
/// external calls are merged so that a 4-byte selector write followed by
/// its argument block reads as one region.
pub fn replace_mem_exp(expr: &Expr, mem_id: &Expr, mem_val: &Expr) -> Expr {
    let rewritten = match expr {
        Expr::Node(op, children) => {
            let new_ch: Vec<Expr> = children
                .iter()
                .map(|c| replace_mem_exp(c, mem_id, mem_val))
                .collect();
            Expr::Node(op.clone(), new_ch)
        }
        other => other.clone(),
    };

    if rewritten.opcode() == Some("mem") {
        if let Some(ch) = rewritten.children() {
            if ch.len() == 1 {
                return memloc::fill_mem(&rewritten, mem_id, mem_val);
            }
        }
    }

    if matches!(
        rewritten.opcode(),
        Some("call") | Some("staticcall") | Some("delegatecall") | Some("callcode")
    ) {
        return merge_call_args(&rewritten);
    }

    rewritten
}

/// Merge adjacent contiguous `mem(range(..))` arguments of a call node:
/// `mem(range(b, 4)), mem(range(b+4, n))` becomes `mem(range(b, n+4))`.
fn merge_call_args(call: &Expr) -> Expr {
    let (op, ch) = match call {
        Expr::Node(op, ch) => (op.clone(), ch.clone()),
        _ => return call.clone(),
    };

    let mut merged: Vec<Expr> = Vec::with_capacity(ch.len());
    for arg in ch {
        if let Some(last) = merged.last() {
            if let (Some((b1, l1)), Some(arg_range)) = (
                last.children()
                    .filter(|_| last.opcode() == Some("mem"))
                    .and_then(|c| c.first())
                    .and_then(memloc::extract_range),
                arg.children()
                    .filter(|_| arg.opcode() == Some("mem"))
                    .and_then(|c| c.first()),
            ) {
                if let Some((b2, l2)) = memloc::extract_range(arg_range) {
                    let end1 = crate::core::algebra::add_op(b1.clone(), l1.clone());
                    if end1 == b2 {
                        let total = crate::core::algebra::add_op(l1, l2);
                        let last_idx = merged.len() - 1;
                        merged[last_idx] = Expr::mem(b1, total);
                        continue;
                    }
                }
            }
        }
        merged.push(arg);
    }

    Expr::Node(op, merged)
}

/// Does executing `line` potentially change the meaning of `expr`?
pub fn affects(line: &Expr, expr: &Expr) -> bool {
    match line.opcode() {
        Some("setvar") => {
            if let Some(ch) = line.children() {
                if let Some(var_id) = ch.first() {
                    return expr.contains(&Expr::node1("var", var_id.clone()));
                }
            }
            false
        }
        // Any memory write moves msize.
        Some("setmem") => expr.contains(&Expr::atom("msize")),
        Some("while") | Some("if") => {
            if let Some(ch) = line.children() {
                ch.iter().any(|c| match c.opcode() {
                    Some("seq") => extract_seq(c).iter().any(|l| affects(l, expr)),
                    _ => affects(c, expr),
                })
            } else {
                false
            }
        }
        _ => false,
    }
}

/// Does any line of `trace` write memory that might overlap `mem_id`?
pub fn trace_affects_mem(trace: &[Expr], mem_id: &Expr) -> bool {
    trace.iter().any(|line| match line.opcode() {
        Some("setmem") => {
            if let Some(ch) = line.children() {
                if let Some(write_range) = ch.first() {
                    return overwrites_mem(write_range, mem_id);
                }
            }
            true
        }
        Some("if") | Some("while") => {
            if let Some(ch) = line.children() {
                ch.iter().any(|c| {
                    if c.opcode() == Some("seq") {
                        trace_affects_mem(&extract_seq(c), mem_id)
                    } else {
                        false
                    }
                })
            } else {
                false
            }
        }
        _ => false,
    })
}

/// Might a write to `write_range` touch `mem_id`?  Writes with undefined
/// extent (the msize idiom) clobber everything.
pub fn overwrites_mem(write_range: &Expr, mem_id: &Expr) -> bool {
    if let Some((_, len)) = memloc::extract_range(write_range) {
        if len == Expr::atom("undefined") {
            return true;
        }
    }
    range_overlaps(write_range, mem_id) != Ternary::False
}

/// Is the location still (possibly) read anywhere in the trace?
///
/// Walks forward; a full overwrite of the location ends its live range, so
/// reads after it don't count.  A `continue` jumps back, so the location
/// is conservatively considered used.
pub fn trace_uses_mem(trace: &[Expr], mem_id: &Expr) -> bool {
    for line in trace {
        if line.opcode() == Some("continue") {
            return true;
        }

        if exp_uses_mem(line, mem_id) {
            return true;
        }

        if line.opcode() == Some("setmem") {
            if let Some(ch) = line.children() {
                if let Some(write_range) = ch.first() {
                    // Fully covered and not read by the write itself: dead
                    // from here on.
                    if memloc::memloc_overwrite(mem_id, write_range).is_empty() {
                        return false;
                    }
                }
            }
        }

        match line.opcode() {
            Some("if") => {
                if let Some(ch) = line.children() {
                    let if_true = ch.get(1).map(extract_seq).unwrap_or_default();
                    let if_false = ch.get(2).map(extract_seq).unwrap_or_default();
                    if trace_uses_mem(&if_true, mem_id) || trace_uses_mem(&if_false, mem_id) {
                        return true;
                    }
                }
            }
            Some("while") => {
                if let Some(ch) = line.children() {
                    let body = ch.get(1).map(extract_seq).unwrap_or_default();
                    if trace_uses_mem(&body, mem_id) {
                        return true;
                    }
                    // Loop entry assignments read pre-loop memory too.
                    if ch.iter().skip(3).any(|sv| exp_uses_mem(sv, mem_id)) {
                        return true;
                    }
                }
            }
            _ => {}
        }
    }
    false
}

/// Does the expression read memory possibly overlapping `mem_id`?
pub fn exp_uses_mem(expr: &Expr, mem_id: &Expr) -> bool {
    if expr.opcode() == Some("setmem") {
        // Only the written value counts as a read; the range is handled by
        // the overwrite logic in the caller.
        if let Some(ch) = expr.children() {
            return ch.len() == 2 && exp_uses_mem(&ch[1], mem_id);
        }
    }
    if expr.opcode() == Some("mem") {
        if let Some(ch) = expr.children() {
            if ch.len() == 1 && range_overlaps(&ch[0], mem_id) != Ternary::False {
                return true;
            }
        }
    }
    if *expr == Expr::atom("msize") {
        return true;
    }
    match expr {
        Expr::Node(_, children) => children.iter().any(|c| exp_uses_mem(c, mem_id)),
        _ => false,
    }
}

/// Does the expression read memory at all?
pub fn exp_reads_mem(expr: &Expr) -> bool {
    if expr.opcode() == Some("mem") {
        return true;
    }
    match expr {
        Expr::Node(_, children) => children.iter().any(exp_reads_mem),
        _ => false,
    }
}
