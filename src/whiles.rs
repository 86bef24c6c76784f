//! Loop analysis: counter extraction and loop-to-memset rewriting.
//!
//! A `while` statement has children `[cond, seq(body), jd, setvar...]`.
//! The trailing `setvar`s assign the loop variables on entry; `continue`
//! statements inside the body carry the per-iteration updates as
//! `[jd, setvar...]`.  When a loop walks memory with a constant stride
//! and a provable iteration count, the whole loop collapses into a single
//! `setmem` over the touched region.

use crate::core::algebra::{self, Ternary};
use crate::core::arithmetic::eval_bool;
use crate::expr::{Expr, Trace};
use crate::utils::helpers::extract_seq;
use primitive_types::U256;

/// Extracted affine loop counters.
#[derive(Debug, Clone)]
pub struct Counters {
    /// Variable id tested by the loop condition.
    pub var_id: Expr,
    /// Its value on loop entry.
    pub start: Expr,
    /// Its per-iteration increment (two's complement for negative steps).
    pub step: Expr,
    /// Number of iterations the loop runs.
    pub num_loops: Expr,
    /// `(id, start, step)` for every loop variable with an affine update.
    pub starts: Vec<(Expr, Expr, Expr)>,
    /// `(id, value)` for every loop variable after the loop exits.
    pub end_vars: Vec<(Expr, Expr)>,
}

/// Try to extract affine counters from a while statement.
///
/// Succeeds only when every loop variable is updated as `v := v + c`, the
/// condition is a single comparison on one of them, and the iteration
/// count divides out exactly.
pub fn parse_counters(while_line: &Expr) -> Option<Counters> {
    let ch = while_line.children()?;
    if while_line.opcode() != Some("while") || ch.len() < 3 {
        return None;
    }
    let cond = &ch[0];
    let body = extract_seq(&ch[1]);
    let jd = &ch[2];

    // Entry assignments.
    let mut starts: Vec<(Expr, Expr)> = Vec::new();
    for sv in ch.iter().skip(3) {
        let svch = sv.children()?;
        if sv.opcode() != Some("setvar") || svch.len() != 2 {
            return None;
        }
        starts.push((svch[0].clone(), svch[1].clone()));
    }

    // Exactly one continue, carrying the updates.
    let updates = find_continues(&body, jd);
    if updates.len() != 1 {
        return None;
    }
    let updates = &updates[0];

    // Every update must be v := v + c.
    let mut steps: Vec<(Expr, Expr)> = Vec::new();
    for sv in updates {
        let svch = sv.children()?;
        if sv.opcode() != Some("setvar") || svch.len() != 2 {
            return None;
        }
        let step = counter_diff(&svch[1], &svch[0])?;
        steps.push((svch[0].clone(), step));
    }

    // Normalise the condition to `var <= stop` or `var >= stop`.
    let (op, lhs, rhs) = {
        let cch = cond.children()?;
        if cch.len() != 2 {
            return None;
        }
        (cond.opcode()?, cch[0].clone(), cch[1].clone())
    };
    let counter_of = |e: &Expr| {
        steps
            .iter()
            .find(|(id, _)| e.contains(&Expr::node1("var", id.clone())))
            .map(|(id, _)| id.clone())
    };
    let (op, var_side, stop) = match (counter_of(&lhs), counter_of(&rhs)) {
        (Some(_), None) => (op.to_string(), lhs, rhs),
        (None, Some(_)) => (swap_cond(op)?, rhs, lhs),
        _ => return None,
    };
    // Move every non-counter addend to the other side, so `i + 4 < n`
    // normalises to `i < n - 4`.
    let (var_id, stop) = move_terms_right(&var_side, stop, &steps)?;

    let start = starts
        .iter()
        .find(|(id, _)| *id == var_id)
        .map(|(_, s)| s.clone())?;
    let step = steps
        .iter()
        .find(|(id, _)| *id == var_id)
        .map(|(_, s)| s.clone())?;

    // Step direction must match the comparison.
    let step_val = step.as_val()?;
    let step_negative = step_val >= U256::one() << 255;
    let upward = matches!(op.as_str(), "lt" | "le");
    if step_val.is_zero() || upward == step_negative {
        return None;
    }

    // Strict bounds: n = distance / |step|, with the distance taken in the
    // direction of travel.  Inclusive bounds run one extra iteration.
    // Either way the division must come out exact.
    let abs_step = if step_negative {
        algebra::sub_op(Expr::zero(), step.clone())
    } else {
        step.clone()
    };
    let distance = if upward {
        algebra::sub_op(stop, start.clone())
    } else {
        algebra::sub_op(start.clone(), stop)
    };
    let distance = match op.as_str() {
        "lt" | "gt" => distance,
        _ => algebra::add_op(distance, abs_step.clone()),
    };
    let num_loops = algebra::div_op(distance, abs_step);
    if num_loops.contains_op("div") {
        return None;
    }
    if algebra::safe_ge_zero(&num_loops) == Ternary::False {
        return None;
    }

    let mut all_starts = Vec::new();
    let mut end_vars = Vec::new();
    for (id, step_i) in &steps {
        let start_i = starts
            .iter()
            .find(|(sid, _)| sid == id)
            .map(|(_, s)| s.clone())?;
        let end = algebra::add_op(
            start_i.clone(),
            algebra::mul_op(step_i.clone(), num_loops.clone()),
        );
        all_starts.push((id.clone(), start_i, step_i.clone()));
        end_vars.push((id.clone(), end));
    }

    Some(Counters {
        var_id,
        start,
        step,
        num_loops,
        starts: all_starts,
        end_vars,
    })
}

/// Normalise the counter side of a comparison: peel a bare `var(id)` out
/// of an additive expression, subtracting the leftover terms from the
/// other side.  Fails when the counter is not a plain addend.
fn move_terms_right(
    side: &Expr,
    other: Expr,
    steps: &[(Expr, Expr)],
) -> Option<(Expr, Expr)> {
    let is_counter = |e: &Expr| -> Option<Expr> {
        match e {
            Expr::Node(o, c) if o == "var" && c.len() == 1 => steps
                .iter()
                .find(|(id, _)| *id == c[0])
                .map(|(id, _)| id.clone()),
            _ => None,
        }
    };
    if let Some(id) = is_counter(side) {
        return Some((id, other));
    }
    let terms = match side {
        Expr::Node(op, ch) if op == "add" => ch,
        _ => return None,
    };

    let mut var_id = None;
    let mut moved = other;
    for t in terms {
        match is_counter(t) {
            Some(id) if var_id.is_none() => var_id = Some(id),
            // A second counter reference, or a term still containing one,
            // leaves the loop unanalysed.
            _ if steps
                .iter()
                .any(|(id, _)| t.contains(&Expr::node1("var", id.clone()))) =>
            {
                return None;
            }
            _ => moved = algebra::sub_op(moved, t.clone()),
        }
    }
    var_id.map(|id| (id, moved))
}

/// `update == var(id) + c` → `Some(c)`.
fn counter_diff(update: &Expr, id: &Expr) -> Option<Expr> {
    let (constant, terms) = algebra::split_const(update);
    if terms == vec![Expr::node1("var", id.clone())] {
        Some(Expr::Val(constant))
    } else {
        None
    }
}

fn swap_cond(op: &str) -> Option<String> {
    // a OP b with operands swapped.
    match op {
        "lt" => Some("gt".to_string()),
        "gt" => Some("lt".to_string()),
        "le" => Some("ge".to_string()),
        "ge" => Some("le".to_string()),
        _ => None,
    }
}

/// Update lists of every `continue` targeting `jd` in a body.
fn find_continues(body: &[Expr], jd: &Expr) -> Vec<Vec<Expr>> {
    let mut found = Vec::new();
    for line in body {
        match line.opcode() {
            Some("continue") => {
                if let Some(ch) = line.children() {
                    if ch.first() == Some(jd) {
                        found.push(ch[1..].to_vec());
                    }
                }
            }
            Some("if") | Some("while") => {
                if let Some(ch) = line.children() {
                    for c in ch.iter().filter(|c| c.opcode() == Some("seq")) {
                        found.extend(find_continues(&extract_seq(c), jd));
                    }
                }
            }
            _ => {}
        }
    }
    found
}

/// Rewrite a memory-walking loop into a single `setmem` plus the final
/// values of its loop variables.
///
/// Recognised bodies, up to the trailing `continue`:
///   * `setmem(range(i, 32), 0)` — a zeroing loop;
///   * `setmem(range(i, 32), mem(range(i + d, 32)))` — a copy loop;
///   * `setmem(range(i, 32), storage(256, 0, j))` with `j += 1` — a copy
///     from a storage array.
///
/// The counter may walk in either direction as long as its step is one
/// word; a downward walk anchors the region at the final index.
pub fn loop_to_setmem(while_line: &Expr) -> Option<Trace> {
    let counters = parse_counters(while_line)?;
    let ch = while_line.children()?;
    let body = extract_seq(&ch[1]);
    let jd = &ch[2];

    if body.len() != 2 {
        return None;
    }
    let write = &body[0];
    if body[1].opcode() != Some("continue")
        || body[1].children().and_then(|c| c.first()) != Some(jd)
    {
        return None;
    }
    let wch = write.children()?;
    if write.opcode() != Some("setmem") || wch.len() != 2 {
        return None;
    }

    // The write target must stride with the counter, 32 bytes at a time.
    let (dst_start, dst_len) = super_range(&wch[0])?;
    if dst_len != Expr::val(32) {
        return None;
    }
    let var_ref = Expr::node1("var", counters.var_id.clone());
    if !dst_start.contains(&var_ref) {
        return None;
    }
    let step_down = counters.step == Expr::val_i64(-32);
    if counters.step != Expr::val(32) && !step_down {
        return None;
    }

    // A downward walk touches the same region; its lowest index is the
    // counter's value on the last iteration.
    let low_idx = if step_down {
        algebra::sub_op(
            counters.start.clone(),
            algebra::mul_op(
                Expr::val(32),
                algebra::sub_op(counters.num_loops.clone(), Expr::one()),
            ),
        )
    } else {
        counters.start.clone()
    };

    let dst0 = subst(&dst_start, &var_ref, &low_idx);
    let region_len = algebra::mul_op(Expr::val(32), counters.num_loops.clone());
    let region = make_range(dst0.clone(), region_len.clone());

    let value = &wch[1];
    let rewritten = if value.is_zero() {
        // Zeros concatenate to zeros.
        Some(Expr::node2("setmem", region.clone(), Expr::zero()))
    } else if value.opcode() == Some("mem") {
        // Copy loop: source must stride identically.
        let (src_start, src_len) = super_range(value.children()?.first()?)?;
        if src_len != Expr::val(32) {
            return None;
        }
        let delta = algebra::sub_op(src_start.clone(), dst_start.clone());
        if delta.contains(&var_ref) {
            return None;
        }
        let src0 = subst(&src_start, &var_ref, &low_idx);
        Some(Expr::node2(
            "setmem",
            region.clone(),
            Expr::node1("mem", make_range(src0, region_len.clone())),
        ))
    } else if value.opcode() == Some("storage") {
        loop_to_setmem_from_storage(&counters, value, &region, &region_len)
    } else {
        None
    }?;

    log::debug!("loop collapsed into {rewritten}");
    let mut out = vec![rewritten];
    for (id, end) in &counters.end_vars {
        out.push(Expr::node2("setvar", id.clone(), end.clone()));
    }
    Some(out)
}

/// The storage-array arm of [`loop_to_setmem`]: a second counter walks the
/// storage keys one slot per iteration.
fn loop_to_setmem_from_storage(
    counters: &Counters,
    value: &Expr,
    region: &Expr,
    region_len: &Expr,
) -> Option<Expr> {
    let sch = value.children()?;
    if sch.len() != 3 || sch[0] != Expr::val(256) || !sch[1].is_zero() {
        return None;
    }
    let key = &sch[2];

    // Find the key counter: a loop variable stepping by one slot.
    let (key_id, key_start, _) = counters
        .starts
        .iter()
        .find(|(id, _, step)| {
            *id != counters.var_id
                && *step == Expr::one()
                && key.contains(&Expr::node1("var", id.clone()))
        })?
        .clone();

    let key_ref = Expr::node1("var", key_id);
    let key0 = subst(key, &key_ref, &key_start);
    let slots = algebra::div_op(region_len.clone(), Expr::val(32));
    if slots.contains_op("div") {
        return None;
    }

    Some(Expr::node2(
        "setmem",
        region.clone(),
        Expr::node3(
            "storage",
            Expr::val(256),
            Expr::zero(),
            make_range(key0, slots),
        ),
    ))
}

/// A `range(start, len)` guarded against provably-negative lengths.
pub fn make_range(start: Expr, len: Expr) -> Expr {
    match algebra::safe_ge_zero(&len) {
        Ternary::True | Ternary::Unknown => Expr::range(start, len),
        Ternary::False => Expr::range(start, algebra::max_op(Expr::zero(), len)),
    }
}

fn super_range(e: &Expr) -> Option<(Expr, Expr)> {
    crate::core::memloc::extract_range(e)
}

/// Substitute and re-normalise, so `add(64, var)` with `var := 0` folds
/// back to `64` instead of keeping a dead term.
fn subst(e: &Expr, var_ref: &Expr, val: &Expr) -> Expr {
    algebra::add_op(Expr::zero(), e.replace(var_ref, val))
}

/// Surface storage keys hidden inside loop variables.
///
/// Two rewrites, both aimed at exposing sha3-based keys to the
/// storage-recognition rules:
///   * an entry `setvar` whose variable is never reassigned inside the
///     loop, and whose value reads no memory, holds the same value on
///     every iteration and is inlined;
///   * a reassigned counter seeded with `sha3(..) + c` has the hash term
///     hoisted out: uses become `sha3 + var` and the variable counts from
///     `c`, with the additive updates left intact.
pub fn propagate_storage_in_loops(trace: &[Expr]) -> Trace {
    let mut result = Trace::new();
    for line in trace {
        match line.opcode() {
            Some("while") => {
                if let Some(ch) = line.children() {
                    let mut cond = ch[0].clone();
                    let mut body = extract_seq(&ch[1]);
                    let jd = ch.get(2).cloned();
                    let mut kept_vars: Vec<Expr> = Vec::new();

                    let updates: Vec<Vec<Expr>> = match &jd {
                        Some(jd) => find_continues(&body, jd),
                        None => vec![],
                    };
                    let reassigned = |id: &Expr| {
                        updates.iter().flatten().any(|sv| {
                            sv.opcode() == Some("setvar")
                                && sv.children().and_then(|c| c.first()) == Some(id)
                        })
                    };
                    let additive = |id: &Expr| {
                        updates
                            .iter()
                            .flatten()
                            .filter(|sv| {
                                sv.opcode() == Some("setvar")
                                    && sv.children().and_then(|c| c.first()) == Some(id)
                            })
                            .all(|sv| {
                                sv.children()
                                    .filter(|c| c.len() == 2)
                                    .map_or(false, |c| counter_diff(&c[1], id).is_some())
                            })
                    };

                    for sv in ch.iter().skip(3) {
                        let inline = sv
                            .children()
                            .filter(|svch| {
                                sv.opcode() == Some("setvar")
                                    && svch.len() == 2
                                    && !svch[1].contains_op("mem")
                                    && !reassigned(&svch[0])
                            })
                            .map(|svch| (svch[0].clone(), svch[1].clone()));
                        match inline {
                            Some((id, val)) => {
                                let var_ref = Expr::node1("var", id);
                                cond = cond.replace(&var_ref, &val);
                                body = body
                                    .iter()
                                    .map(|l| l.replace(&var_ref, &val))
                                    .collect();
                            }
                            None => {
                                let hoist = sv
                                    .children()
                                    .filter(|svch| {
                                        sv.opcode() == Some("setvar")
                                            && svch.len() == 2
                                            && !svch[1].contains_op("mem")
                                            && additive(&svch[0])
                                    })
                                    .and_then(|svch| {
                                        split_sha3_seed(&svch[1])
                                            .map(|(sha, rest)| (svch[0].clone(), sha, rest))
                                    });
                                match (hoist, &jd) {
                                    (Some((id, sha, rest)), Some(jd)) => {
                                        // Hoist the hash out of the counter:
                                        // uses become sha3 + var, the counter
                                        // runs from the remaining seed.
                                        log::debug!("hoisting {sha} out of loop variable {id}");
                                        let var_ref = Expr::node1("var", id.clone());
                                        let shifted =
                                            algebra::add_op(sha.clone(), var_ref.clone());
                                        cond = cond.replace(&var_ref, &shifted);
                                        body = body
                                            .iter()
                                            .map(|l| l.replace(&var_ref, &shifted))
                                            .collect();
                                        body = unshift_updates(&body, jd, &id, &sha);
                                        kept_vars.push(Expr::node2("setvar", id, rest));
                                    }
                                    _ => kept_vars.push(sv.clone()),
                                }
                            }
                        }
                    }

                    let body = propagate_storage_in_loops(&body);
                    let mut new_ch = vec![cond, Expr::node("seq", body)];
                    if let Some(jd) = jd {
                        new_ch.push(jd);
                    }
                    new_ch.extend(kept_vars);
                    result.push(Expr::Node("while".to_string(), new_ch));
                }
            }
            Some("if") => {
                if let Some(ch) = line.children() {
                    let if_true = ch.get(1).map(extract_seq).unwrap_or_default();
                    let if_false = ch.get(2).map(extract_seq).unwrap_or_default();
                    result.push(Expr::node3(
                        "if",
                        ch[0].clone(),
                        Expr::node("seq", propagate_storage_in_loops(&if_true)),
                        Expr::node("seq", propagate_storage_in_loops(&if_false)),
                    ));
                }
            }
            _ => result.push(line.clone()),
        }
    }
    result
}

/// `value == sha3(..) + rest` → the hash term and the remaining sum.
fn split_sha3_seed(value: &Expr) -> Option<(Expr, Expr)> {
    if value.opcode() == Some("sha3") {
        return Some((value.clone(), Expr::zero()));
    }
    let ch = match value {
        Expr::Node(op, ch) if op == "add" => ch,
        _ => return None,
    };
    let pos = ch.iter().position(|t| t.opcode() == Some("sha3"))?;
    let mut rest = Expr::zero();
    for (i, t) in ch.iter().enumerate() {
        if i != pos {
            rest = algebra::add_op(rest, t.clone());
        }
    }
    Some((ch[pos].clone(), rest))
}

/// Subtract `offset` back out of the `continue` update values for `id`,
/// undoing the blanket substitution there: the update moves the shifted
/// variable, not the shifted value.
fn unshift_updates(body: &[Expr], jd: &Expr, id: &Expr, offset: &Expr) -> Vec<Expr> {
    body.iter()
        .map(|line| {
            let ch = match line.children() {
                Some(ch) => ch,
                None => return line.clone(),
            };
            match line.opcode() {
                Some("continue") if ch.first() == Some(jd) => {
                    let mut new_ch = vec![ch[0].clone()];
                    for sv in &ch[1..] {
                        let fixed = sv
                            .children()
                            .filter(|svch| {
                                sv.opcode() == Some("setvar")
                                    && svch.len() == 2
                                    && &svch[0] == id
                            })
                            .map(|svch| {
                                Expr::node2(
                                    "setvar",
                                    svch[0].clone(),
                                    algebra::sub_op(svch[1].clone(), offset.clone()),
                                )
                            });
                        new_ch.push(fixed.unwrap_or_else(|| sv.clone()));
                    }
                    Expr::Node("continue".to_string(), new_ch)
                }
                Some(op @ ("if" | "while")) => {
                    let new_ch: Vec<Expr> = ch
                        .iter()
                        .map(|c| {
                            if c.opcode() == Some("seq") {
                                Expr::node(
                                    "seq",
                                    unshift_updates(&extract_seq(c), jd, id, offset),
                                )
                            } else {
                                c.clone()
                            }
                        })
                        .collect();
                    Expr::Node(op.to_string(), new_ch)
                }
                _ => line.clone(),
            }
        })
        .collect()
}

/// Fold statically-known conditions.
///
/// `if` statements with a decided condition collapse into the taken
/// branch.  A `while` whose condition is statically false never runs: its
/// entry assignments survive as plain `setvar`s.  A statically true
/// condition becomes the canonical `bool(1)`.
pub fn cleanup_conds(trace: &[Expr]) -> Trace {
    let mut result = Trace::new();
    for line in trace {
        match line.opcode() {
            Some("if") => {
                if let Some(ch) = line.children() {
                    let cond = &ch[0];
                    let if_true = ch.get(1).map(extract_seq).unwrap_or_default();
                    let if_false = ch.get(2).map(extract_seq).unwrap_or_default();
                    match eval_bool(cond) {
                        Some(true) => result.extend(cleanup_conds(&if_true)),
                        Some(false) => result.extend(cleanup_conds(&if_false)),
                        None => result.push(Expr::node3(
                            "if",
                            cond.clone(),
                            Expr::node("seq", cleanup_conds(&if_true)),
                            Expr::node("seq", cleanup_conds(&if_false)),
                        )),
                    }
                }
            }
            Some("while") => {
                if let Some(ch) = line.children() {
                    let cond = &ch[0];
                    let body = extract_seq(&ch[1]);
                    match eval_bool(cond) {
                        Some(false) => {
                            for sv in ch.iter().skip(3) {
                                result.push(sv.clone());
                            }
                        }
                        decided => {
                            let new_cond = if decided == Some(true) {
                                Expr::node1("bool", Expr::one())
                            } else {
                                cond.clone()
                            };
                            let mut new_ch =
                                vec![new_cond, Expr::node("seq", cleanup_conds(&body))];
                            new_ch.extend(ch[2..].to_vec());
                            result.push(Expr::Node("while".to_string(), new_ch));
                        }
                    }
                }
            }
            _ => result.push(line.clone()),
        }
    }
    result
}

/// Write target ranges of every `setmem` in a trace, loops included.
pub fn find_setmems(trace: &[Expr]) -> Vec<Expr> {
    let mut out = Vec::new();
    for line in trace {
        match line.opcode() {
            Some("setmem") => {
                if let Some(ch) = line.children() {
                    if let Some(r) = ch.first() {
                        out.push(r.clone());
                    }
                }
            }
            Some("if") | Some("while") => {
                if let Some(ch) = line.children() {
                    for c in ch.iter().filter(|c| c.opcode() == Some("seq")) {
                        out.extend(find_setmems(&extract_seq(c)));
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Upper bound on memory offsets a loop writes, using the counters' final
/// values.  `None` when the loop's extent cannot be determined.
pub fn while_max_memidx(while_line: &Expr) -> Option<Expr> {
    let ch = while_line.children()?;
    let body = extract_seq(ch.get(1)?);
    let writes = find_setmems(&body);
    if writes.is_empty() {
        return None;
    }
    let counters = parse_counters(while_line);

    let mut bound: Option<Expr> = None;
    for r in writes {
        let (start, len) = super_range(&r)?;
        let mut end = algebra::add_op(start, len);
        if let Some(c) = &counters {
            // The deepest write happens on the last iteration, one step
            // short of the counter's final value.
            for (id, start_i, step_i) in &c.starts {
                let last = algebra::add_op(
                    start_i.clone(),
                    algebra::mul_op(
                        step_i.clone(),
                        algebra::sub_op(c.num_loops.clone(), Expr::one()),
                    ),
                );
                end = end.replace(&Expr::node1("var", id.clone()), &last);
            }
        }
        if end.contains_op("var") {
            return None;
        }
        bound = Some(match bound {
            Some(b) => algebra::max_op(b, end),
            None => end,
        });
    }
    bound
}
