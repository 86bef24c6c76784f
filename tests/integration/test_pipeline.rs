//! End-to-end pipeline tests over whole traces.

use lapidary::errors::TraceError;
use lapidary::expr::{Expr, Trace};
use lapidary::trace::simplify_trace;

#[test]
fn test_constant_chain_folds_to_return() {
    // var := 2 + 3; mem[64..96] := var; return mem[64..96]
    let trace = vec![
        Expr::setvar(Expr::val(1), Expr::node2("add", Expr::val(2), Expr::val(3))),
        Expr::setmem(Expr::val(64), Expr::val(32), Expr::var(1)),
        Expr::node1("return", Expr::mem(Expr::val(64), Expr::val(32))),
    ];
    let out = simplify_trace(&trace).unwrap();
    assert_eq!(out, vec![Expr::node1("return", Expr::val(5))]);
}

#[test]
fn test_dead_stores_are_removed() {
    let trace = vec![
        Expr::setmem(Expr::val(64), Expr::val(32), Expr::val(1)),
        Expr::setmem(Expr::val(64), Expr::val(32), Expr::val(2)),
        Expr::node1("return", Expr::mem(Expr::val(64), Expr::val(32))),
    ];
    let out = simplify_trace(&trace).unwrap();
    assert_eq!(out, vec![Expr::node1("return", Expr::val(2))]);
}

#[test]
fn test_unknown_write_offset_blocks_forwarding() {
    // A write at a symbolic offset may alias the tracked location, so the
    // read cannot be resolved and every line survives.
    let clobber = Expr::node2(
        "setmem",
        Expr::range(Expr::atom("k"), Expr::val(32)),
        Expr::zero(),
    );
    let trace = vec![
        Expr::setmem(Expr::val(64), Expr::val(32), Expr::val(5)),
        clobber,
        Expr::node1("return", Expr::mem(Expr::val(64), Expr::val(32))),
    ];
    let out = simplify_trace(&trace).unwrap();
    assert_eq!(out, trace);
}

#[test]
fn test_forwarding_into_both_branches() {
    let trace = vec![
        Expr::setmem(Expr::val(64), Expr::val(32), Expr::val(7)),
        Expr::node3(
            "if",
            Expr::atom("c"),
            Expr::node(
                "seq",
                vec![Expr::node1("return", Expr::mem(Expr::val(64), Expr::val(32)))],
            ),
            Expr::node("seq", vec![Expr::node1("return", Expr::zero())]),
        ),
    ];
    let out = simplify_trace(&trace).unwrap();
    assert_eq!(
        out,
        vec![Expr::node3(
            "if",
            Expr::atom("c"),
            Expr::node("seq", vec![Expr::node1("return", Expr::val(7))]),
            Expr::node("seq", vec![Expr::node1("return", Expr::zero())]),
        )]
    );
}

#[test]
fn test_msize_resolves_to_high_water_mark() {
    let trace = vec![
        Expr::setmem(Expr::val(64), Expr::val(32), Expr::val(1)),
        Expr::setmem(Expr::val(96), Expr::val(32), Expr::val(2)),
        Expr::node1("return", Expr::atom("msize")),
    ];
    let out = simplify_trace(&trace).unwrap();
    assert_eq!(out, vec![Expr::node1("return", Expr::val(128))]);
}

#[test]
fn test_packed_write_splits_when_kept_alive() {
    // The packed word cannot be forwarded into an unresolvable read, so it
    // splits into two independent byte-range writes instead.
    let hi = Expr::node4(
        "mask_shl",
        Expr::val(160),
        Expr::val(0),
        Expr::val(96),
        Expr::atom("a"),
    );
    let lo = Expr::node4(
        "mask_shl",
        Expr::val(96),
        Expr::val(0),
        Expr::val(0),
        Expr::atom("b"),
    );
    let reader = Expr::node1("log0", Expr::mem(Expr::atom("p"), Expr::val(32)));
    let trace = vec![
        Expr::node2(
            "setmem",
            Expr::range(Expr::val(64), Expr::val(32)),
            Expr::node2("or", hi, lo),
        ),
        reader.clone(),
    ];
    let out = simplify_trace(&trace).unwrap();
    assert_eq!(
        out,
        vec![
            Expr::node2(
                "setmem",
                Expr::range(Expr::val(84), Expr::val(12)),
                Expr::node4(
                    "mask_shl",
                    Expr::val(96),
                    Expr::val(0),
                    Expr::val(0),
                    Expr::atom("b"),
                ),
            ),
            Expr::node2(
                "setmem",
                Expr::range(Expr::val(64), Expr::val(20)),
                Expr::node4(
                    "mask_shl",
                    Expr::val(160),
                    Expr::val(0),
                    Expr::val(0),
                    Expr::atom("a"),
                ),
            ),
            reader,
        ]
    );
}

#[test]
fn test_storage_copy_loop_collapses_end_to_end() {
    let jd = Expr::atom("loop1");
    let w = Expr::Node(
        "while".to_string(),
        vec![
            Expr::node2("lt", Expr::var(1), Expr::val(160)),
            Expr::node(
                "seq",
                vec![
                    Expr::node2(
                        "setmem",
                        Expr::range(Expr::var(1), Expr::val(32)),
                        Expr::node3("storage", Expr::val(256), Expr::zero(), Expr::var(2)),
                    ),
                    Expr::Node(
                        "continue".to_string(),
                        vec![
                            jd.clone(),
                            Expr::setvar(
                                Expr::val(1),
                                Expr::node2("add", Expr::val(32), Expr::var(1)),
                            ),
                            Expr::setvar(
                                Expr::val(2),
                                Expr::node2("add", Expr::val(1), Expr::var(2)),
                            ),
                        ],
                    ),
                ],
            ),
            jd,
            Expr::setvar(Expr::val(1), Expr::zero()),
            Expr::setvar(Expr::val(2), Expr::zero()),
        ],
    );
    let trace = vec![
        w,
        Expr::node1("return", Expr::mem(Expr::val(0), Expr::val(160))),
    ];
    let out = simplify_trace(&trace).unwrap();
    assert_eq!(
        out,
        vec![Expr::node1(
            "return",
            Expr::node3(
                "storage",
                Expr::val(256),
                Expr::zero(),
                Expr::range(Expr::zero(), Expr::val(5)),
            ),
        )]
    );
}

#[test]
fn test_uncollapsible_loop_survives_with_renumbered_counter() {
    // A loop with an opaque body keeps its structure; the readability
    // pass renumbers its counter down to var 0.
    let jd = Expr::atom("loop1");
    let w = Expr::Node(
        "while".to_string(),
        vec![
            Expr::node2("lt", Expr::var(1), Expr::val(160)),
            Expr::node(
                "seq",
                vec![
                    Expr::node1("log0", Expr::var(1)),
                    Expr::Node(
                        "continue".to_string(),
                        vec![
                            jd.clone(),
                            Expr::setvar(
                                Expr::val(1),
                                Expr::node2("add", Expr::val(32), Expr::var(1)),
                            ),
                        ],
                    ),
                ],
            ),
            jd,
            Expr::setvar(Expr::val(1), Expr::zero()),
        ],
    );
    let out = simplify_trace(&[w]).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].opcode(), Some("while"));
    assert!(out[0].contains(&Expr::var(0)));
    assert!(!out[0].contains(&Expr::var(1)));
}

#[test]
fn test_dangling_continue_rejected() {
    let trace = vec![Expr::Node(
        "continue".to_string(),
        vec![Expr::atom("loop1")],
    )];
    assert!(matches!(
        simplify_trace(&trace),
        Err(TraceError::DanglingContinue { .. })
    ));
}

#[test]
fn test_while_without_continue_rejected() {
    let w = Expr::Node(
        "while".to_string(),
        vec![
            Expr::atom("c"),
            Expr::node("seq", vec![Expr::node0("stop")]),
            Expr::atom("loop1"),
        ],
    );
    assert!(matches!(
        simplify_trace(&[w]),
        Err(TraceError::MissingContinue { .. })
    ));
}

#[test]
fn test_malformed_statement_rejected() {
    let bad = Expr::node1("setvar", Expr::val(1));
    let err = simplify_trace(&[bad]).unwrap_err();
    assert!(matches!(err, TraceError::MalformedStatement(_)));
}

#[test]
fn test_json_trace_roundtrip() {
    let json = r#"[
        {"Node": ["return", [
            {"Node": ["add", [{"Val": "0x2"}, {"Val": "0x3"}]]}
        ]]}
    ]"#;
    let trace: Trace = serde_json::from_str(json).unwrap();
    let out = simplify_trace(&trace).unwrap();
    assert_eq!(out, vec![Expr::node1("return", Expr::val(5))]);

    let back = serde_json::to_string(&out).unwrap();
    let reparsed: Trace = serde_json::from_str(&back).unwrap();
    assert_eq!(reparsed, out);
}
