//! Interprocedural taint propagation with closure-capture modeling.
//!
//! `lambdaflow` tracks how tainted data moves through a single method and
//! the closures defined inside it, including the pattern that defeats
//! purely frame-local analyses: a closure mutating a captured variable,
//! with the mutation observed by the enclosing frame after the call.
//!
//! ```text
//! var source: Object? = null
//! val lambda = { source = Origin.source() }
//! lambda()
//! Origin.sink(source)   // flow must be reported
//! ```
//!
//! # Architecture
//!
//! The pipeline has four stages:
//!
//! 1. **Capture resolution** ([`capture`]): every free name in a closure
//!    body binds to an enclosing variable, either by value (a snapshot
//!    taken at closure creation) or by reference (a shared mutable cell,
//!    exactly one per outer variable). Names that fail to resolve degrade
//!    to cells seeded with worst-case taint, never silently dropped.
//!
//! 2. **Closure units** ([`closure`]): each closure definition becomes one
//!    synthetic callable with a memoized symbolic summary of its body. The
//!    summary speaks in entry locations rather than concrete taint, so one
//!    summary serves every call site without losing per-call precision.
//!
//! 3. **Propagation** ([`taint`]): a forward monotone fixed point over the
//!    method CFG. Assignments overwrite, control-flow joins union, and
//!    reads and writes of by-reference captured variables route through
//!    their shared cells. Invoking a closure instantiates its summary
//!    against the environment at the call point.
//!
//! 4. **Oracle matching** ([`oracle`]): produced findings are partitioned
//!    against a fixture's declared expectations into matched, missing, and
//!    unexpected, with support for forbidden flows and expectations known
//!    to be over-approximations.
//!
//! The [`fixture`] module runs batches of fixtures in parallel, keeping
//! tooling failures apart from oracle mismatches.
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeSet;
//!
//! use lambdaflow::capture::CapturePolicy;
//! use lambdaflow::ir::builder::MethodBuilder;
//! use lambdaflow::ir::types::Operand;
//! use lambdaflow::taint::{analyze_method, PropagationConfig, Rule, RuleSet};
//!
//! let rules = RuleSet::new(vec![Rule {
//!     code: 1,
//!     name: "test flow".to_string(),
//!     description: String::new(),
//!     sources: BTreeSet::from(["TestSource".to_string()]),
//!     sinks: BTreeSet::from(["TestSink".to_string()]),
//! }]);
//!
//! let mut m = MethodBuilder::new("issue");
//! let source = m.declare_mut("source");
//! m.assign_const(source);
//! let lambda = m.closure(|c| {
//!     c.source_free("source", "TestSource");
//! });
//! let lambda_var = m.declare("lambda");
//! m.create_closure(lambda_var, lambda);
//! m.invoke(lambda_var);
//! m.sink("Origin.sink", "TestSink", Operand::Var(source));
//! let method = m.finish().unwrap();
//!
//! let analysis = analyze_method(
//!     &method,
//!     &rules,
//!     CapturePolicy::BoxedMutable,
//!     PropagationConfig::default(),
//! )
//! .unwrap();
//! assert_eq!(analysis.findings.len(), 1);
//! ```

pub mod capture;
pub mod closure;
pub mod error;
pub mod fixture;
pub mod ir;
pub mod oracle;
pub mod taint;

pub use error::AnalysisError;
