//! Variable inlining and dead assignment elimination.
//!
//! `setvar` lines whose values can be forwarded are folded into their use
//! sites.  Two things block forwarding: a `setmem` invalidates values that
//! read memory, and a loop that reassigns a variable invalidates the
//! pre-loop binding.  In both cases the assignment is re-emitted just
//! before the blocking line if the variable is still referenced.

use crate::expr::{Expr, Trace};
use crate::utils::helpers::extract_seq;
use std::collections::{HashMap, HashSet};

/// One pass of variable forwarding over a trace.
///
/// `required_after` lists `var` references that outlive this trace (used
/// when recursing into branch bodies); assignments they depend on are kept
/// even when locally dead.
pub fn cleanup_vars(trace: &[Expr], required_after: &[Expr]) -> Trace {
    let usage = build_usage_map(trace);

    let mut result = Trace::new();
    // Pending substitutions: var id -> value.
    let mut subs: Vec<(Expr, Expr)> = Vec::new();
    // Ids whose values read memory and die at the next setmem.
    let mut mem_vars: HashSet<Expr> = HashSet::new();

    for (idx, line) in trace.iter().enumerate() {
        // A loop that reassigns a variable kills its pre-loop binding;
        // this must happen before substituting into the loop itself.
        if line.opcode() == Some("while") && !subs.is_empty() {
            let reassigned: HashSet<Expr> = subs
                .iter()
                .filter(|(id, _)| while_reassigns_var(line, id))
                .map(|(id, _)| id.clone())
                .collect();
            if !reassigned.is_empty() {
                flush_subs(&mut subs, &mut result, &trace[idx..], |id| {
                    reassigned.contains(id)
                });
            }
        }

        let line = apply_subs(line, &subs);

        if line.opcode() == Some("setvar") {
            if let Some(ch) = line.children() {
                if ch.len() == 2 {
                    let var_id = ch[0].clone();
                    let var_ref = Expr::node1("var", var_id.clone());
                    let var_val = ch[1].clone();

                    if var_val.contains_op("mem") {
                        mem_vars.insert(var_id.clone());
                    }

                    // Rebinding: the old value must not leak past this line.
                    subs.retain(|(id, _)| *id != var_id);

                    let global_count = usage.get(&var_id).copied().unwrap_or(0);
                    let required_externally =
                        required_after.iter().any(|r| r.contains(&var_ref));

                    if global_count == 0 && !required_externally {
                        continue;
                    }

                    if required_externally {
                        result.push(Expr::node2("setvar", var_id.clone(), var_val.clone()));
                    }
                    subs.push((var_id, var_val));
                    continue;
                }
            }
        }

        // A memory write kills every substitution whose value reads memory.
        if line.opcode() == Some("setmem") && !mem_vars.is_empty() {
            flush_subs(
                &mut subs,
                &mut result,
                &trace[idx + 1..],
                |id| mem_vars.contains(id),
            );
            mem_vars.clear();
        }

        match line.opcode() {
            Some("if") => {
                if let Some(ch) = line.children() {
                    let cond = ch.first().cloned().unwrap_or(Expr::zero());
                    let if_true = ch.get(1).map(extract_seq).unwrap_or_default();
                    let if_false = ch.get(2).map(extract_seq).unwrap_or_default();

                    let mut all_required: Vec<Expr> = required_after.to_vec();
                    all_required.extend(find_var_refs(&trace[idx + 1..]));

                    result.push(Expr::node3(
                        "if",
                        cond,
                        Expr::node("seq", cleanup_vars(&if_true, &all_required)),
                        Expr::node("seq", cleanup_vars(&if_false, &all_required)),
                    ));
                }
            }
            Some("while") => {
                if let Some(ch) = line.children() {
                    let cond = ch.first().cloned().unwrap_or(Expr::zero());
                    let body = ch.get(1).map(extract_seq).unwrap_or_default();
                    let rest: Vec<Expr> =
                        if ch.len() > 2 { ch[2..].to_vec() } else { vec![] };

                    let mut all_required: Vec<Expr> = required_after.to_vec();
                    all_required.extend(find_var_refs(&trace[idx + 1..]));
                    all_required.extend(find_var_refs_in_expr(&cond));
                    // Loop variables are live across iterations.
                    for sv in &rest {
                        all_required.extend(find_var_refs_in_expr(sv));
                        if sv.opcode() == Some("setvar") {
                            if let Some(svch) = sv.children() {
                                if let Some(id) = svch.first() {
                                    all_required.push(Expr::node1("var", id.clone()));
                                }
                            }
                        }
                    }

                    let mut new_ch = vec![cond, Expr::node("seq", cleanup_vars(&body, &all_required))];
                    new_ch.extend(rest);
                    result.push(Expr::Node("while".to_string(), new_ch));
                }
            }
            _ => result.push(line),
        }
    }

    result
}

/// Drop matching substitutions, re-emitting `setvar` for any that is still
/// referenced from `here` onwards (the blocking line included).
fn flush_subs(
    subs: &mut Vec<(Expr, Expr)>,
    result: &mut Trace,
    here: &[Expr],
    mut should_flush: impl FnMut(&Expr) -> bool,
) {
    let mut flushed: Vec<(Expr, Expr)> = Vec::new();
    subs.retain(|(id, val)| {
        if should_flush(id) {
            flushed.push((id.clone(), val.clone()));
            false
        } else {
            true
        }
    });
    for (id, val) in flushed {
        let var_ref = Expr::node1("var", id.clone());
        if here.iter().any(|l| l.contains(&var_ref)) {
            result.push(Expr::node2("setvar", id, val));
        }
    }
}

fn apply_subs(expr: &Expr, subs: &[(Expr, Expr)]) -> Expr {
    let mut result = expr.clone();
    for (id, val) in subs {
        result = result.replace(&Expr::node1("var", id.clone()), val);
    }
    result
}

/// Count `var` references per variable id across a trace.
fn build_usage_map(trace: &[Expr]) -> HashMap<Expr, usize> {
    let mut map = HashMap::new();
    for line in trace {
        count_var_refs(line, &mut map);
    }
    map
}

fn count_var_refs(expr: &Expr, map: &mut HashMap<Expr, usize>) {
    if expr.opcode() == Some("var") {
        if let Some(ch) = expr.children() {
            if let Some(id) = ch.first() {
                *map.entry(id.clone()).or_insert(0) += 1;
            }
        }
    }
    if let Some(ch) = expr.children() {
        for c in ch {
            count_var_refs(c, map);
        }
    }
}

/// Does the loop assign `id` anywhere: entry assignments, body `setvar`s,
/// or `continue` update lists?
fn while_reassigns_var(while_line: &Expr, id: &Expr) -> bool {
    let ch = match while_line.children() {
        Some(ch) => ch,
        None => return false,
    };
    let assigns = |e: &Expr| -> bool {
        e.opcode() == Some("setvar")
            && e.children().and_then(|c| c.first()) == Some(id)
    };
    if ch.iter().skip(3).any(|sv| assigns(sv)) {
        return true;
    }
    let body = ch.get(1).map(extract_seq).unwrap_or_default();
    trace_assigns_var(&body, id)
}

fn trace_assigns_var(trace: &[Expr], id: &Expr) -> bool {
    trace.iter().any(|line| match line.opcode() {
        Some("setvar") => line.children().and_then(|c| c.first()) == Some(id),
        Some("continue") => line
            .children()
            .map(|ch| {
                ch.iter().skip(1).any(|sv| {
                    sv.opcode() == Some("setvar")
                        && sv.children().and_then(|c| c.first()) == Some(id)
                })
            })
            .unwrap_or(false),
        Some("if") | Some("while") => line
            .children()
            .map(|ch| {
                ch.iter()
                    .filter(|c| c.opcode() == Some("seq"))
                    .any(|c| trace_assigns_var(&extract_seq(c), id))
            })
            .unwrap_or(false),
        _ => false,
    })
}

/// All `var` references in a trace.
pub fn find_var_refs(trace: &[Expr]) -> Vec<Expr> {
    let mut refs = Vec::new();
    for line in trace {
        collect_var_refs(line, &mut refs);
    }
    refs
}

fn find_var_refs_in_expr(expr: &Expr) -> Vec<Expr> {
    let mut refs = Vec::new();
    collect_var_refs(expr, &mut refs);
    refs
}

fn collect_var_refs(expr: &Expr, refs: &mut Vec<Expr>) {
    if expr.opcode() == Some("var") {
        refs.push(expr.clone());
    }
    if let Some(ch) = expr.children() {
        for c in ch {
            collect_var_refs(c, refs);
        }
    }
}
