//! Memory range algebra tests.

use lapidary::core::memloc::*;
use lapidary::core::Ternary;
use lapidary::core::algebra::add_op;
use lapidary::expr::Expr;

fn range(start: u64, len: u64) -> Expr {
    Expr::range(Expr::val(start), Expr::val(len))
}

#[test]
fn test_overlap_concrete() {
    assert_eq!(range_overlaps(&range(65, 32), &range(64, 32)), Ternary::True);
    assert_eq!(range_overlaps(&range(100, 32), &range(64, 32)), Ternary::False);
    // Adjacent ranges do not overlap.
    assert_eq!(range_overlaps(&range(96, 32), &range(64, 32)), Ternary::False);
}

#[test]
fn test_overlap_shared_symbolic_base() {
    let x = Expr::atom("x");
    let r1 = Expr::range(add_op(x.clone(), Expr::val(65)), Expr::val(32));
    let r2 = Expr::range(add_op(x.clone(), Expr::val(64)), Expr::val(32));
    let r3 = Expr::range(add_op(x.clone(), Expr::val(128)), Expr::val(32));
    assert_eq!(range_overlaps(&r1, &r2), Ternary::True);
    assert_eq!(range_overlaps(&r1, &r3), Ternary::False);
}

#[test]
fn test_overlap_symbolic_length_is_unknown() {
    let r1 = Expr::range(Expr::val(64), Expr::atom("n"));
    assert_eq!(range_overlaps(&r1, &range(0, 32)), Ternary::Unknown);
}

#[test]
fn test_overlap_unrelated_bases_is_unknown() {
    let r1 = Expr::range(Expr::atom("p"), Expr::val(32));
    assert_eq!(range_overlaps(&r1, &range(64, 32)), Ternary::Unknown);
}

#[test]
fn test_memloc_overwrite_middle() {
    // Overwriting the middle leaves two fragments.
    let out = memloc_overwrite(&range(64, 32), &range(70, 10));
    assert_eq!(out, vec![range(64, 6), range(80, 16)]);
}

#[test]
fn test_memloc_overwrite_exact_and_covering() {
    assert!(memloc_overwrite(&range(64, 32), &range(64, 32)).is_empty());
    assert!(memloc_overwrite(&range(64, 32), &range(0, 128)).is_empty());
}

#[test]
fn test_memloc_overwrite_undecided_returns_original() {
    let symbolic = Expr::range(Expr::atom("k"), Expr::val(32));
    let original = range(64, 32);
    assert_eq!(memloc_overwrite(&original, &symbolic), vec![original]);
}

#[test]
fn test_splits_mem_left_fragment_is_high_bytes() {
    // Clobber the right half: the surviving left half holds the top 128
    // bits of the original value, shifted down.
    let v = Expr::atom("v");
    let parts = splits_mem(&range(64, 32), &range(80, 16), &v).unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].0, range(64, 16));
    assert_eq!(
        parts[0].1,
        Expr::node4(
            "mask_shl",
            Expr::val(128),
            Expr::val(128),
            Expr::val_i64(-128),
            v
        )
    );
}

#[test]
fn test_splits_mem_undecided_is_none() {
    let clobber = Expr::range(Expr::atom("k"), Expr::val(32));
    assert!(splits_mem(&range(64, 32), &clobber, &Expr::atom("v")).is_none());
}

#[test]
fn test_fill_mem_symbolic_base_exact_match() {
    // Exact matches work even with fully symbolic ranges.
    let r = Expr::range(Expr::atom("p"), Expr::atom("n"));
    let read = Expr::node1("mem", r.clone());
    assert_eq!(fill_mem(&read, &r, &Expr::val(9)), Expr::val(9));
}

#[test]
fn test_fill_mem_unrelated_read_untouched() {
    let read = Expr::mem(Expr::atom("p"), Expr::val(32));
    let filled = fill_mem(&read, &range(64, 32), &Expr::val(9));
    assert_eq!(filled, read);
}

#[test]
fn test_fill_mem_tail_slice() {
    // Read the last 4 bytes of a 32-byte write: the low 32 bits.
    let v = Expr::atom("v");
    let read = Expr::mem(Expr::val(92), Expr::val(4));
    let filled = fill_mem(&read, &range(64, 32), &v);
    assert_eq!(
        filled,
        Expr::node4("mask_shl", Expr::val(32), Expr::val(0), Expr::val(0), v)
    );
}

#[test]
fn test_apply_mask_to_range_address() {
    // Selecting the low 160 bits of a word is reading its last 20 bytes.
    let out = apply_mask_to_range(&range(212, 32), 160, 0).unwrap();
    assert_eq!(out, range(224, 20));
}

#[test]
fn test_apply_mask_to_range_rejects_unaligned() {
    assert!(apply_mask_to_range(&range(0, 32), 161, 0).is_none());
    // Mask wider than the range.
    assert!(apply_mask_to_range(&range(0, 4), 160, 0).is_none());
}

#[test]
fn test_split_or_disjoint_windows() {
    let packed = Expr::node2(
        "or",
        Expr::node4(
            "mask_shl",
            Expr::val(160),
            Expr::val(0),
            Expr::val(96),
            Expr::atom("owner"),
        ),
        Expr::node4(
            "mask_shl",
            Expr::val(96),
            Expr::val(0),
            Expr::val(0),
            Expr::atom("count"),
        ),
    );
    let parts = split_or(&packed);
    assert_eq!(parts.len(), 2);
    assert_eq!((parts[0].0, parts[0].1), (96, 0));
    assert_eq!((parts[1].0, parts[1].1), (160, 96));
}

#[test]
fn test_split_or_opaque_value() {
    // A value that is not an or of masks covers the whole word.
    let parts = split_or(&Expr::atom("v"));
    assert_eq!(parts, vec![(256, 0, Expr::atom("v"))]);
}
