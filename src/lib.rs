//! Lapidary — symbolic simplifier for decompiled EVM execution traces.
//!
//! Takes a trace of statements over symbolic 256-bit expressions (memory
//! and storage writes, variable assignments, structured loops) and rewrites
//! it into the smallest equivalent form: constants folded, variables and
//! memory writes forwarded, packed words split, and memory-walking loops
//! collapsed into single range operations.

pub mod core;
pub mod utils;

pub mod errors;
pub mod expr;
pub mod matcher;
pub mod memory;
pub mod simplify;
pub mod trace;
pub mod vars;
pub mod whiles;
