//! Trace-level simplification pipeline.
//!
//! [`simplify_trace`] is the public entry point: it validates the input
//! contract, then runs the expression, variable, memory, condition, and
//! loop passes to a fixed point, and finishes with one-way readability
//! rewrites that are deliberately kept out of the fixed point.

use crate::core::algebra;
use crate::errors::{TraceError, MAX_ITERATIONS};
use crate::expr::{Expr, Trace};
use crate::memory::cleanup_mems;
use crate::simplify::Simplifier;
use crate::utils::helpers::{extract_seq, replace_f, rewrite_trace};
use crate::vars::cleanup_vars;
use crate::whiles::{self, cleanup_conds, loop_to_setmem, propagate_storage_in_loops};
use primitive_types::U256;

/// Simplify a trace by running all passes until convergence.
///
/// The input must satisfy the trace contract (checked up front): every
/// `continue` targets an enclosing `while`, every `while` contains a
/// `continue` for its own label, and statements are well-formed.
pub fn simplify_trace(trace: &[Expr]) -> Result<Trace, TraceError> {
    check_trace(trace, &mut Vec::new())?;

    let simplifier = Simplifier::new();
    let mut trace = trace.to_vec();

    for count in 0.. {
        if count >= MAX_ITERATIONS {
            log::warn!("simplification did not converge after {MAX_ITERATIONS} iterations");
            break;
        }

        let old = trace.clone();

        trace = trace.iter().map(|e| simplifier.exp(e)).collect();
        trace = cleanup_vars(&trace, &[]);
        trace = cleanup_mems(&trace);
        trace = rewrite_trace(&trace, &split_setmem);
        trace = cleanup_msize(&trace).0;
        trace = cleanup_conds(&trace);
        trace = collapse_loops(&trace);
        trace = propagate_storage_in_loops(&trace);

        if trace == old {
            log::debug!("converged after {} iterations", count + 1);
            break;
        }
    }

    Ok(readability_pass(&trace))
}

/// Validate the structural contract of an input trace.
fn check_trace(trace: &[Expr], loop_stack: &mut Vec<Expr>) -> Result<(), TraceError> {
    for line in trace {
        match line.opcode() {
            Some("while") => {
                let ch = line
                    .children()
                    .filter(|ch| ch.len() >= 3)
                    .ok_or_else(|| malformed(line))?;
                let jd = ch[2].clone();
                for sv in ch.iter().skip(3) {
                    if sv.opcode() != Some("setvar")
                        || sv.children().map(|c| c.len()) != Some(2)
                    {
                        return Err(malformed(sv));
                    }
                }
                let body = extract_seq(&ch[1]);
                if !body_continues_to(&body, &jd) {
                    return Err(TraceError::MissingContinue {
                        loop_id: jd.to_string(),
                    });
                }
                loop_stack.push(jd);
                check_trace(&body, loop_stack)?;
                loop_stack.pop();
            }
            Some("continue") => {
                let jd = line
                    .children()
                    .and_then(|ch| ch.first())
                    .ok_or_else(|| malformed(line))?;
                if !loop_stack.contains(jd) {
                    return Err(TraceError::DanglingContinue {
                        loop_id: jd.to_string(),
                    });
                }
                for sv in line.children().map(|ch| &ch[1..]).unwrap_or(&[]) {
                    if sv.opcode() != Some("setvar")
                        || sv.children().map(|c| c.len()) != Some(2)
                    {
                        return Err(malformed(sv));
                    }
                }
            }
            Some("if") => {
                let ch = line
                    .children()
                    .filter(|ch| ch.len() == 3)
                    .ok_or_else(|| malformed(line))?;
                check_trace(&extract_seq(&ch[1]), loop_stack)?;
                check_trace(&extract_seq(&ch[2]), loop_stack)?;
            }
            Some("setmem") | Some("setvar") => {
                if line.children().map(|ch| ch.len()) != Some(2) {
                    return Err(malformed(line));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn malformed(line: &Expr) -> TraceError {
    TraceError::MalformedStatement(line.to_string())
}

/// Rewrite recognised memory-walking loops into single `setmem`s,
/// innermost loops first.
fn collapse_loops(trace: &[Expr]) -> Trace {
    let mut result = Trace::new();
    for line in trace {
        match line.opcode() {
            Some("while") => {
                if let Some(ch) = line.children() {
                    let body = collapse_loops(&extract_seq(&ch[1]));
                    let mut new_ch = vec![ch[0].clone(), Expr::node("seq", body)];
                    new_ch.extend(ch[2..].to_vec());
                    let rebuilt = Expr::Node("while".to_string(), new_ch);
                    match loop_to_setmem(&rebuilt) {
                        Some(lines) => result.extend(lines),
                        None => result.push(rebuilt),
                    }
                }
            }
            Some("if") => {
                if let Some(ch) = line.children() {
                    result.push(Expr::node3(
                        "if",
                        ch[0].clone(),
                        Expr::node("seq", collapse_loops(&extract_seq(&ch[1]))),
                        Expr::node("seq", collapse_loops(&extract_seq(&ch[2]))),
                    ));
                }
            }
            _ => result.push(line.clone()),
        }
    }
    result
}

fn body_continues_to(body: &[Expr], jd: &Expr) -> bool {
    body.iter().any(|line| match line.opcode() {
        Some("continue") => line.children().and_then(|ch| ch.first()) == Some(jd),
        Some("if") | Some("while") => line
            .children()
            .map(|ch| {
                ch.iter()
                    .filter(|c| c.opcode() == Some("seq"))
                    .any(|c| body_continues_to(&extract_seq(c), jd))
            })
            .unwrap_or(false),
        _ => false,
    })
}

// ===========================================================================
// setmem splitting
// ===========================================================================

/// Split a word-sized `setmem` of or-ed disjoint windows into independent
/// byte-aligned writes.  Writes are big-endian: the window at bit offset
/// `o` of a 32-byte word starts `(256 - o - size) / 8` bytes in.
fn split_setmem(line: &Expr) -> Vec<Expr> {
    let keep = || vec![line.clone()];

    if line.opcode() != Some("setmem") {
        return keep();
    }
    let ch = match line.children() {
        Some(ch) if ch.len() == 2 => ch,
        _ => return keep(),
    };
    let (start, len) = match crate::core::memloc::extract_range(&ch[0]) {
        Some(r) => r,
        None => return keep(),
    };
    if len != Expr::val(32) {
        return keep();
    }

    let parts = crate::core::memloc::split_or(&ch[1]);
    if parts.len() < 2 {
        return keep();
    }

    // All windows must be byte-aligned and pairwise disjoint.
    let mut covered: Vec<(u64, u64)> = Vec::new();
    for &(size, offset, _) in &parts {
        if size == 0 || size % 8 != 0 || offset % 8 != 0 || offset + size > 256 {
            return keep();
        }
        if covered.iter().any(|&(s, o)| offset < o + s && o < offset + size) {
            return keep();
        }
        covered.push((size, offset));
    }

    parts
        .into_iter()
        .map(|(size, offset, value)| {
            let byte_off = (256 - offset - size) / 8;
            let write_start = algebra::add_op(start.clone(), Expr::val(byte_off));
            Expr::node2(
                "setmem",
                Expr::range(write_start, Expr::val(size / 8)),
                value,
            )
        })
        .collect()
}

// ===========================================================================
// msize resolution
// ===========================================================================

/// Replace `msize` reads with the high-water mark of memory writes so far.
///
/// Returns the rewritten trace and the high-water mark after it, `None`
/// once an unbounded write makes the mark untrackable (from then on
/// `msize` is left alone).
fn cleanup_msize(trace: &[Expr]) -> (Trace, Option<Expr>) {
    cleanup_msize_from(trace, Some(Expr::zero()))
}

fn cleanup_msize_from(trace: &[Expr], mut high: Option<Expr>) -> (Trace, Option<Expr>) {
    let msize = Expr::atom("msize");
    let mut result = Trace::new();

    for line in trace {
        let line = match &high {
            Some(mark) if line.contains(&msize) => line.replace(&msize, &align32(mark)),
            _ => line.clone(),
        };

        match line.opcode() {
            Some("setmem") => {
                if let Some(h) = high.take() {
                    high = line
                        .children()
                        .and_then(|ch| ch.first())
                        .and_then(crate::core::memloc::extract_range)
                        .map(|(a, l)| algebra::max_op(h, algebra::add_op(a, l)))
                        .filter(|e| !e.contains(&Expr::atom("undefined")));
                }
                result.push(line);
            }
            Some("if") => {
                if let Some(ch) = line.children() {
                    let (new_true, high_true) =
                        cleanup_msize_from(&extract_seq(&ch[1]), high.clone());
                    let (new_false, high_false) =
                        cleanup_msize_from(&extract_seq(&ch[2]), high.clone());
                    high = match (high_true, high_false) {
                        (Some(a), Some(b)) => Some(algebra::max_op(a, b)),
                        _ => None,
                    };
                    result.push(Expr::node3(
                        "if",
                        ch[0].clone(),
                        Expr::node("seq", new_true),
                        Expr::node("seq", new_false),
                    ));
                }
            }
            Some("while") => {
                if let Some(h) = high.take() {
                    high = whiles::while_max_memidx(&line).map(|end| algebra::max_op(h, end));
                }
                result.push(line);
            }
            _ => result.push(line),
        }
    }

    (result, high)
}

/// Round a concrete mark up to a word boundary; symbolic marks come from
/// word-sized writes already.
fn align32(e: &Expr) -> Expr {
    match e.as_val() {
        Some(v) => {
            let rem = v % U256::from(32u64);
            if rem.is_zero() {
                e.clone()
            } else {
                Expr::Val(v + (U256::from(32u64) - rem))
            }
        }
        None => e.clone(),
    }
}

// ===========================================================================
// Readability pass (one-way, applied once after convergence)
// ===========================================================================

fn readability_pass(trace: &[Expr]) -> Trace {
    let trace: Trace = trace
        .iter()
        .map(|e| replace_f(e, &|x| algebra::canonise_max(x)))
        .map(|e| replace_f(&e, &|x| algebra::max_to_add(x)))
        .collect();

    let trace = name_msize_offsets(&trace);
    renumber_loop_vars(&trace)
}

/// A `setmem` whose start carries a `max(...)` addend reads better when
/// the mark gets a name: emit `setvar("_msize", m)` once and refer to
/// the variable from there on.
fn name_msize_offsets(trace: &[Expr]) -> Trace {
    for (idx, line) in trace.iter().enumerate() {
        let mark = match max_addend_in_setmem_start(line) {
            Some(m) => m,
            None => continue,
        };
        let var_ref = Expr::node1("var", Expr::atom("_msize"));
        let mut result: Trace = trace[..idx].to_vec();
        result.push(Expr::node2("setvar", Expr::atom("_msize"), mark.clone()));
        let rest: Trace = trace[idx..]
            .iter()
            .map(|l| l.replace(&mark, &var_ref))
            .collect();
        result.extend(name_msize_offsets(&rest));
        return result;
    }
    trace.to_vec()
}

fn max_addend_in_setmem_start(line: &Expr) -> Option<Expr> {
    if line.opcode() != Some("setmem") {
        return None;
    }
    let (start, _) = crate::core::memloc::extract_range(line.children()?.first()?)?;
    match start {
        Expr::Node(op, ch) if op == "add" => {
            ch.into_iter().find(|t| t.opcode() == Some("max"))
        }
        _ => None,
    }
}

/// Renumber loop variables to small indices: the condition counter of
/// each loop becomes var 0 and the remaining loop variables 1, 2, ...,
/// skipping any index the rest of the trace still uses.  The rename
/// covers the whole tail so references past the loop stay consistent.
fn renumber_loop_vars(trace: &[Expr]) -> Trace {
    let mut result = Trace::new();
    for (idx, line) in trace.iter().enumerate() {
        match line.opcode() {
            Some("while") => {
                let mut rest: Trace = trace[idx..].to_vec();
                let mut counter_id = None;
                if let Some(c) = whiles::parse_counters(line) {
                    let (renamed, new_id) = renumber_var(&rest, &c.var_id, 0);
                    rest = renamed;
                    counter_id = Some(new_id);
                }

                let entry_ids: Vec<Expr> = rest[0]
                    .children()
                    .map(|ch| {
                        ch.iter()
                            .skip(3)
                            .filter_map(|sv| sv.children().and_then(|c| c.first().cloned()))
                            .collect()
                    })
                    .unwrap_or_default();
                let mut next = 1u64;
                for id in entry_ids {
                    if Some(&id) == counter_id.as_ref() {
                        continue;
                    }
                    let (renamed, new_id) = renumber_var(&rest, &id, next);
                    rest = renamed;
                    if let Some(v) = new_id.as_val() {
                        next = v.low_u64() + 1;
                    }
                }

                let line = rest.remove(0);
                if let Some(ch) = line.children() {
                    let body = renumber_loop_vars(&extract_seq(&ch[1]));
                    let mut new_ch = vec![ch[0].clone(), Expr::node("seq", body)];
                    new_ch.extend(ch[2..].to_vec());
                    result.push(Expr::Node("while".to_string(), new_ch));
                }
                result.extend(renumber_loop_vars(&rest));
                return result;
            }
            Some("if") => {
                if let Some(ch) = line.children() {
                    result.push(Expr::node3(
                        "if",
                        ch[0].clone(),
                        Expr::node("seq", renumber_loop_vars(&extract_seq(&ch[1]))),
                        Expr::node("seq", renumber_loop_vars(&extract_seq(&ch[2]))),
                    ));
                }
            }
            _ => result.push(line.clone()),
        }
    }
    result
}

/// Rename a loop variable to the smallest index at or above `candidate`
/// that the trace does not already use.  Returns the rewritten trace
/// and the id actually chosen.
fn renumber_var(trace: &[Expr], old: &Expr, mut candidate: u64) -> (Trace, Expr) {
    while *old != Expr::val(candidate)
        && trace
            .iter()
            .any(|l| l.contains(&Expr::node1("var", Expr::val(candidate))))
    {
        candidate += 1;
    }
    let new_id = Expr::val(candidate);
    if *old == new_id {
        return (trace.to_vec(), new_id);
    }
    let old_ref = Expr::node1("var", old.clone());
    let new_ref = Expr::node1("var", new_id.clone());
    let out = trace
        .iter()
        .map(|l| rewrite_setvar_ids(&l.replace(&old_ref, &new_ref), old, &new_id))
        .collect();
    (out, new_id)
}

fn rewrite_setvar_ids(expr: &Expr, id: &Expr, new_id: &Expr) -> Expr {
    match expr {
        Expr::Node(op, ch) if op == "setvar" && ch.first() == Some(id) => {
            let mut new_ch = ch.clone();
            new_ch[0] = new_id.clone();
            new_ch[1] = rewrite_setvar_ids(&new_ch[1], id, new_id);
            Expr::Node(op.clone(), new_ch)
        }
        Expr::Node(op, ch) => Expr::Node(
            op.clone(),
            ch.iter().map(|c| rewrite_setvar_ids(c, id, new_id)).collect(),
        ),
        other => other.clone(),
    }
}
