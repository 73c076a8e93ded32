//! Batch execution of analysis fixtures.
//!
//! A fixture bundles a method, a capture policy, and an oracle. The runner
//! analyzes fixtures in parallel and keeps tooling failures (malformed
//! expectations, runaway fixed points) strictly apart from oracle
//! mismatches: a fixture that times out is broken tooling, not a taint
//! verdict, and must not poison the rest of the batch.

use std::time::Duration;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::capture::CapturePolicy;
use crate::error::AnalysisError;
use crate::ir::types::Method;
use crate::oracle::{Expectations, MatchReport};
use crate::taint::{analyze_method, MethodAnalysis, PropagationConfig, RuleSet};

/// One runnable fixture.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub method: Method,
    pub policy: CapturePolicy,
    pub expectations: Expectations,
}

/// How one fixture ended.
#[derive(Debug, Clone)]
pub enum FixtureStatus {
    Passed,
    /// The oracle disagreed with the produced findings.
    Mismatch(MatchReport),
    /// Analysis itself failed; no verdict exists.
    ToolingFailure(AnalysisError),
}

impl FixtureStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, FixtureStatus::Passed)
    }
}

/// Result of one fixture, with the analysis kept for inspection when one
/// was produced.
#[derive(Debug, Clone)]
pub struct FixtureOutcome {
    pub fixture: String,
    pub status: FixtureStatus,
    pub analysis: Option<MethodAnalysis>,
}

/// Batch-level knobs.
#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    /// Wall-clock bound per fixture.
    pub timeout: Duration,
    /// Optional iteration cap passed through to propagation.
    pub max_iterations: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_iterations: None,
        }
    }
}

/// Analyze one fixture end to end.
///
/// # Errors
///
/// Any [`AnalysisError`]: expectation validation runs first and fails fast,
/// then capture resolution, unit summarization, and propagation.
pub fn analyze_fixture(
    fixture: &Fixture,
    rules: &RuleSet,
    config: &RunnerConfig,
) -> Result<(MethodAnalysis, MatchReport), AnalysisError> {
    fixture.expectations.validate(rules)?;
    let analysis = analyze_method(
        &fixture.method,
        rules,
        fixture.policy,
        PropagationConfig {
            max_iterations: config.max_iterations,
            timeout: Some(config.timeout),
        },
    )?;
    let report = fixture.expectations.matches(&analysis.findings);
    Ok((analysis, report))
}

/// Run a batch of fixtures in parallel. Outcomes come back in input order,
/// so batch output is deterministic regardless of scheduling.
pub fn run_fixtures(
    fixtures: &[Fixture],
    rules: &RuleSet,
    config: &RunnerConfig,
) -> Vec<FixtureOutcome> {
    let outcomes: Vec<FixtureOutcome> = fixtures
        .par_iter()
        .map(|fixture| {
            let name = fixture.expectations.fixture.clone();
            match analyze_fixture(fixture, rules, config) {
                Ok((analysis, report)) => FixtureOutcome {
                    fixture: name,
                    status: if report.passed() {
                        FixtureStatus::Passed
                    } else {
                        FixtureStatus::Mismatch(report)
                    },
                    analysis: Some(analysis),
                },
                Err(err) => {
                    warn!(fixture = %name, error = %err, "fixture failed to analyze");
                    FixtureOutcome {
                        fixture: name,
                        status: FixtureStatus::ToolingFailure(err),
                        analysis: None,
                    }
                }
            }
        })
        .collect();

    let passed = outcomes.iter().filter(|o| o.status.is_passed()).count();
    info!(
        total = outcomes.len(),
        passed,
        failed = outcomes.len() - passed,
        "fixture batch finished"
    );
    outcomes
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::ir::builder::MethodBuilder;
    use crate::ir::types::Operand;
    use crate::oracle::ExpectedFinding;
    use crate::taint::Rule;

    fn rules() -> RuleSet {
        RuleSet::new(vec![Rule {
            code: 1,
            name: "source to sink".to_string(),
            description: String::new(),
            sources: BTreeSet::from(["TestSource".to_string()]),
            sinks: BTreeSet::from(["TestSink".to_string()]),
        }])
    }

    fn flow_fixture(name: &str, expect_flow: bool) -> Fixture {
        let mut m = MethodBuilder::new(name);
        let x = m.declare_mut("x");
        m.source(x, "TestSource");
        m.sink("Origin.sink", "TestSink", Operand::Var(x));
        let expected = if expect_flow {
            vec![ExpectedFinding {
                callee: "Origin.sink".to_string(),
                source_kind: "TestSource".to_string(),
                sink_kind: "TestSink".to_string(),
                rule: None,
                may_be_false_positive: false,
                sink_position: None,
            }]
        } else {
            Vec::new()
        };
        Fixture {
            method: m.finish().unwrap(),
            policy: CapturePolicy::BoxedMutable,
            expectations: Expectations {
                fixture: name.to_string(),
                expected,
                forbidden: Vec::new(),
            },
        }
    }

    #[test]
    fn test_batch_preserves_input_order() {
        let fixtures = vec![
            flow_fixture("a", true),
            flow_fixture("b", false),
            flow_fixture("c", true),
        ];
        let outcomes = run_fixtures(&fixtures, &rules(), &RunnerConfig::default());
        let names: Vec<&str> = outcomes.iter().map(|o| o.fixture.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(outcomes[0].status.is_passed());
        assert!(matches!(outcomes[1].status, FixtureStatus::Mismatch(_)));
        assert!(outcomes[2].status.is_passed());
    }

    #[test]
    fn test_tooling_failure_does_not_poison_batch() {
        let mut broken = flow_fixture("broken", true);
        broken.expectations.expected[0].source_kind = "Bogus".to_string();
        let fixtures = vec![broken, flow_fixture("fine", true)];
        let outcomes = run_fixtures(&fixtures, &rules(), &RunnerConfig::default());

        assert!(matches!(
            outcomes[0].status,
            FixtureStatus::ToolingFailure(AnalysisError::MalformedExpectations { .. })
        ));
        assert!(outcomes[1].status.is_passed());
    }

    #[test]
    fn test_iteration_cap_is_a_tooling_failure() {
        let fixtures = vec![flow_fixture("capped", true)];
        let config = RunnerConfig {
            timeout: Duration::from_secs(10),
            max_iterations: Some(0),
        };
        let outcomes = run_fixtures(&fixtures, &rules(), &config);
        assert!(matches!(
            outcomes[0].status,
            FixtureStatus::ToolingFailure(AnalysisError::FixedPointTimeout { .. })
        ));
    }
}
