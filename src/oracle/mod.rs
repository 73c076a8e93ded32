//! Expectation matching for analysis fixtures.
//!
//! A fixture declares the findings it expects; the oracle partitions the
//! produced findings into matched, unexpected, and missing, plus hits on
//! explicitly forbidden flows. Matching is structural on
//! `(callee, source kind, sink kind)` and only becomes positional when an
//! expectation pins a sink position. The report is a pure function of its
//! two inputs, so matching the same results twice gives the same verdict.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;
use crate::ir::types::Point;
use crate::taint::types::{Finding, RuleSet};

/// Sink kind used for taint conservatively reaching an escaped closure's
/// unknown caller. Valid in expectations without a declaring rule.
pub use crate::taint::types::UNKNOWN_CALLER_SINK;

/// One expected (or forbidden) finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedFinding {
    pub callee: String,
    pub source_kind: String,
    pub sink_kind: String,
    /// When set, only a finding reported under this rule code matches.
    #[serde(default)]
    pub rule: Option<u32>,
    /// The flow is expected but known to be an over-approximation; its
    /// absence does not fail the fixture.
    #[serde(default)]
    pub may_be_false_positive: bool,
    /// When set, only a finding at exactly this point matches.
    #[serde(default)]
    pub sink_position: Option<Point>,
}

impl ExpectedFinding {
    fn matches(&self, finding: &Finding) -> bool {
        self.callee == finding.callee
            && self.source_kind == finding.source_kind
            && self.sink_kind == finding.sink_kind
            && self.rule.map_or(true, |code| code == finding.rule)
            && self
                .sink_position
                .map_or(true, |position| position == finding.sink_point)
    }
}

/// The oracle for one fixture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectations {
    pub fixture: String,
    #[serde(default)]
    pub expected: Vec<ExpectedFinding>,
    #[serde(default)]
    pub forbidden: Vec<ExpectedFinding>,
}

impl Expectations {
    /// Check every referenced kind against the active rules, before any
    /// propagation runs.
    ///
    /// # Errors
    ///
    /// [`AnalysisError::MalformedExpectations`] naming the first unknown
    /// kind.
    pub fn validate(&self, rules: &RuleSet) -> Result<(), AnalysisError> {
        for entry in self.expected.iter().chain(&self.forbidden) {
            if !rules.knows_source(&entry.source_kind) {
                return Err(AnalysisError::MalformedExpectations {
                    fixture: self.fixture.clone(),
                    detail: format!("no rule declares source kind `{}`", entry.source_kind),
                });
            }
            if entry.sink_kind != UNKNOWN_CALLER_SINK && !rules.knows_sink(&entry.sink_kind) {
                return Err(AnalysisError::MalformedExpectations {
                    fixture: self.fixture.clone(),
                    detail: format!("no rule declares sink kind `{}`", entry.sink_kind),
                });
            }
        }
        Ok(())
    }

    /// Parse an expectation set from its JSON representation.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`serde_json::Error`] on malformed input;
    /// kind-level validation happens separately in [`Self::validate`].
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Expectations that exactly describe `findings`; matching them against
    /// the same findings is all-matched.
    pub fn from_findings(fixture: impl Into<String>, findings: &[Finding]) -> Self {
        Self {
            fixture: fixture.into(),
            expected: findings
                .iter()
                .map(|f| ExpectedFinding {
                    callee: f.callee.clone(),
                    source_kind: f.source_kind.clone(),
                    sink_kind: f.sink_kind.clone(),
                    rule: Some(f.rule),
                    may_be_false_positive: false,
                    sink_position: Some(f.sink_point),
                })
                .collect(),
            forbidden: Vec::new(),
        }
    }

    /// Partition `findings` against these expectations.
    pub fn matches(&self, findings: &[Finding]) -> MatchReport {
        let mut claimed = vec![false; findings.len()];
        let mut matched = Vec::new();
        let mut missing = Vec::new();

        for expected in &self.expected {
            let slot = findings
                .iter()
                .enumerate()
                .find(|(i, f)| !claimed[*i] && expected.matches(f));
            match slot {
                Some((i, finding)) => {
                    claimed[i] = true;
                    matched.push((expected.clone(), finding.clone()));
                }
                None => missing.push(expected.clone()),
            }
        }

        let unexpected: Vec<Finding> = findings
            .iter()
            .enumerate()
            .filter(|(i, _)| !claimed[*i])
            .map(|(_, f)| f.clone())
            .collect();

        let forbidden_hits: Vec<Finding> = findings
            .iter()
            .filter(|f| self.forbidden.iter().any(|e| e.matches(f)))
            .cloned()
            .collect();

        MatchReport {
            matched,
            missing,
            unexpected,
            forbidden_hits,
        }
    }
}

/// Outcome of matching findings against one fixture's expectations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchReport {
    pub matched: Vec<(ExpectedFinding, Finding)>,
    /// Expected but not produced.
    pub missing: Vec<ExpectedFinding>,
    /// Produced but not expected.
    pub unexpected: Vec<Finding>,
    /// Produced findings matching a forbidden template.
    pub forbidden_hits: Vec<Finding>,
}

impl MatchReport {
    /// The fixture passes when every hard expectation matched, nothing
    /// extra was produced, and no forbidden flow appeared. A missing
    /// expectation flagged `may_be_false_positive` does not fail.
    pub fn passed(&self) -> bool {
        self.unexpected.is_empty()
            && self.forbidden_hits.is_empty()
            && self.missing.iter().all(|e| e.may_be_false_positive)
    }
}

impl fmt::Display for MatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} matched, {} missing, {} unexpected, {} forbidden",
            self.matched.len(),
            self.missing.len(),
            self.unexpected.len(),
            self.forbidden_hits.len()
        )?;
        for expected in &self.missing {
            let note = if expected.may_be_false_positive {
                " (may be false positive)"
            } else {
                ""
            };
            writeln!(
                f,
                "  - missing: {} -> {} at {}{note}",
                expected.source_kind, expected.sink_kind, expected.callee
            )?;
        }
        for finding in &self.unexpected {
            writeln!(f, "  + unexpected: {finding}")?;
        }
        for finding in &self.forbidden_hits {
            writeln!(f, "  ! forbidden: {finding}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{BlockId, GraphRef};

    fn finding(callee: &str, sink_index: usize) -> Finding {
        Finding {
            rule: 1,
            callee: callee.to_string(),
            source_kind: "TestSource".to_string(),
            sink_kind: "TestSink".to_string(),
            source_point: None,
            sink_point: Point {
                graph: GraphRef::Method,
                block: BlockId(0),
                index: sink_index,
            },
        }
    }

    fn expected(callee: &str) -> ExpectedFinding {
        ExpectedFinding {
            callee: callee.to_string(),
            source_kind: "TestSource".to_string(),
            sink_kind: "TestSink".to_string(),
            rule: None,
            may_be_false_positive: false,
            sink_position: None,
        }
    }

    #[test]
    fn test_rule_code_only_when_declared() {
        let mut pinned = expected("Origin.sink");
        pinned.rule = Some(2);
        let oracle = Expectations {
            fixture: "f".to_string(),
            expected: vec![pinned],
            forbidden: Vec::new(),
        };
        // Finding carries rule 1; the declared code 2 must not match it.
        let report = oracle.matches(&[finding("Origin.sink", 0)]);
        assert_eq!(report.missing.len(), 1);
    }

    #[test]
    fn test_exact_match_passes() {
        let oracle = Expectations {
            fixture: "f".to_string(),
            expected: vec![expected("Origin.sink")],
            forbidden: Vec::new(),
        };
        let report = oracle.matches(&[finding("Origin.sink", 0)]);
        assert!(report.passed());
        assert_eq!(report.matched.len(), 1);
    }

    #[test]
    fn test_unexpected_fails() {
        let oracle = Expectations {
            fixture: "f".to_string(),
            expected: Vec::new(),
            forbidden: Vec::new(),
        };
        let report = oracle.matches(&[finding("Origin.sink", 0)]);
        assert!(!report.passed());
        assert_eq!(report.unexpected.len(), 1);
    }

    #[test]
    fn test_missing_fails_unless_flagged() {
        let mut oracle = Expectations {
            fixture: "f".to_string(),
            expected: vec![expected("Origin.sink")],
            forbidden: Vec::new(),
        };
        assert!(!oracle.matches(&[]).passed());

        oracle.expected[0].may_be_false_positive = true;
        assert!(oracle.matches(&[]).passed());
    }

    #[test]
    fn test_positional_only_when_declared() {
        let mut pinned = expected("Origin.sink");
        pinned.sink_position = Some(Point {
            graph: GraphRef::Method,
            block: BlockId(0),
            index: 7,
        });
        let oracle = Expectations {
            fixture: "f".to_string(),
            expected: vec![pinned],
            forbidden: Vec::new(),
        };
        // Same structure, wrong point.
        let report = oracle.matches(&[finding("Origin.sink", 3)]);
        assert_eq!(report.missing.len(), 1);
        assert_eq!(report.unexpected.len(), 1);

        let report = oracle.matches(&[finding("Origin.sink", 7)]);
        assert!(report.passed());
    }

    #[test]
    fn test_forbidden_flow_fails() {
        let oracle = Expectations {
            fixture: "f".to_string(),
            expected: vec![expected("Origin.sink")],
            forbidden: vec![expected("Origin.sink")],
        };
        let report = oracle.matches(&[finding("Origin.sink", 0)]);
        assert!(!report.passed());
        assert_eq!(report.forbidden_hits.len(), 1);
    }

    #[test]
    fn test_each_finding_claimed_once() {
        let oracle = Expectations {
            fixture: "f".to_string(),
            expected: vec![expected("Origin.sink"), expected("Origin.sink")],
            forbidden: Vec::new(),
        };
        // Two expectations, one finding: the second goes missing.
        let report = oracle.matches(&[finding("Origin.sink", 0)]);
        assert_eq!(report.matched.len(), 1);
        assert_eq!(report.missing.len(), 1);
    }

    #[test]
    fn test_reflexive_and_idempotent() {
        let findings = vec![finding("Origin.sink", 0), finding("other", 4)];
        let oracle = Expectations::from_findings("f", &findings);
        let first = oracle.matches(&findings);
        assert!(first.passed());
        assert_eq!(first.matched.len(), 2);
        // Same inputs, same verdict.
        assert_eq!(oracle.matches(&findings), first);
    }

    #[test]
    fn test_expectations_from_json_defaults() {
        let json = r#"{
            "fixture": "KotlinAnonymousFunction",
            "expected": [{
                "callee": "Origin.sink",
                "source_kind": "TestSource",
                "sink_kind": "TestSink"
            }]
        }"#;
        let oracle = Expectations::from_json(json).unwrap();
        assert_eq!(oracle.expected.len(), 1);
        assert_eq!(oracle.expected[0].rule, None);
        assert!(!oracle.expected[0].may_be_false_positive);
        assert!(oracle.expected[0].sink_position.is_none());
        assert!(oracle.forbidden.is_empty());
    }

    #[test]
    fn test_validate_rejects_unknown_kinds() {
        use std::collections::BTreeSet;

        use crate::taint::types::Rule;

        let rules = RuleSet::new(vec![Rule {
            code: 1,
            name: "r".to_string(),
            description: String::new(),
            sources: BTreeSet::from(["TestSource".to_string()]),
            sinks: BTreeSet::from(["TestSink".to_string()]),
        }]);

        let mut oracle = Expectations {
            fixture: "f".to_string(),
            expected: vec![expected("Origin.sink")],
            forbidden: Vec::new(),
        };
        assert!(oracle.validate(&rules).is_ok());

        oracle.expected[0].sink_kind = UNKNOWN_CALLER_SINK.to_string();
        assert!(oracle.validate(&rules).is_ok());

        oracle.expected[0].sink_kind = "Bogus".to_string();
        assert!(matches!(
            oracle.validate(&rules),
            Err(AnalysisError::MalformedExpectations { .. })
        ));
    }
}
