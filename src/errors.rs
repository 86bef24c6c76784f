//! Domain-specific error types.
//!
//! Uses `thiserror` for structured error definitions rather than relying
//! solely on `anyhow` for everything.  Only violations of the input
//! contract become errors; undecidable analysis results are tri-state
//! values, not `Err`s.

use thiserror::Error;

/// Violations of the trace contract checked at the public boundary.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("continue targets loop id {loop_id} outside any enclosing while")]
    DanglingContinue { loop_id: String },

    #[error("while loop {loop_id} has no continue for its own id")]
    MissingContinue { loop_id: String },

    #[error("malformed statement: {0}")]
    MalformedStatement(String),
}

/// Maximum fixed-point iterations of the top-level simplification loop.
pub const MAX_ITERATIONS: usize = 40;
/// Simplifier memo cache entry cap; the cache is cleared when exceeded.
pub const MAX_CACHE_ENTRIES: usize = 100_000;
