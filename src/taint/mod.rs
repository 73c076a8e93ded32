//! Taint domain and propagation.

pub mod propagation;
pub mod types;

pub use propagation::{MethodAnalysis, PropagationConfig, PropagationEngine};
pub use types::{Finding, Rule, RuleSet, Taint, TaintEnvironment, TaintLabel, Target};

use crate::capture::{CaptureModel, CapturePolicy};
use crate::closure::ClosureRegistry;
use crate::error::AnalysisError;
use crate::ir::types::Method;

/// Resolve captures, build closure units, and run propagation in one call.
///
/// # Errors
///
/// Propagates [`AnalysisError`] from unit summarization or the method-level
/// fixed point.
pub fn analyze_method(
    method: &Method,
    rules: &RuleSet,
    policy: CapturePolicy,
    config: PropagationConfig,
) -> Result<MethodAnalysis, AnalysisError> {
    let captures = CaptureModel::resolve(method, policy);
    let registry = ClosureRegistry::build(method, &captures)?;
    PropagationEngine::new(method, &captures, &registry, rules, config).analyze()
}
