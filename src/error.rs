//! Analysis-level error taxonomy.
//!
//! Tooling failures (bad fixtures, runaway fixed points, malformed
//! expectation files) are kept strictly apart from analysis verdicts: a
//! mismatch between produced and expected findings is reported through
//! [`crate::oracle::MatchReport`], never through this type.

use thiserror::Error;

use crate::ir::types::CfgError;

/// Errors that abort analysis of a single fixture.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    /// The propagation fixed point exceeded its iteration or wall-clock
    /// bound. Indicates a non-monotone transfer function or a degenerate
    /// fixture, not a taint verdict.
    #[error(
        "fixed point did not stabilize in `{method}` after {iterations} iterations ({elapsed_ms}ms)"
    )]
    FixedPointTimeout {
        method: String,
        iterations: usize,
        elapsed_ms: u64,
    },

    /// The expectation set references kinds no rule declares, or is
    /// internally inconsistent. Raised before propagation starts.
    #[error("malformed expectations for fixture `{fixture}`: {detail}")]
    MalformedExpectations { fixture: String, detail: String },

    /// The fixture's control-flow graph failed structural validation.
    #[error("control-flow graph error: {0}")]
    Cfg(#[from] CfgError),
}
