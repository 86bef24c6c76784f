//! Symbolic 256-bit algebra: concrete EVM arithmetic, term-level
//! canonicalisation, mask decomposition, and memory range reasoning.

pub mod algebra;
pub mod arithmetic;
pub mod masks;
pub mod memloc;

pub use algebra::Ternary;
