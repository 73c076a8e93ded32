//! Core taint domain: labels, rules, environments, findings.

use std::collections::BTreeSet;
use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::capture::CellId;
use crate::ir::types::{ClosureId, Point, VarId};

// ============================================================================
// Labels and rules
// ============================================================================

/// Sink kind for taint that conservatively reaches the unknown caller of
/// an escaped closure. Reserved; no rule declares it.
pub const UNKNOWN_CALLER_SINK: &str = "UnknownExternalCaller";

/// A taint kind, e.g. `"TestSource"`. Labels are opaque to propagation;
/// only the matcher pairs them with sink kinds through rules.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaintLabel(pub String);

impl TaintLabel {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn kind(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaintLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One taint mark carried by a value: the label plus where it entered,
/// if it entered at a concrete program point.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Taint {
    pub label: TaintLabel,
    /// `None` for synthetic seeds (unresolved captures), `Some` for taint
    /// introduced by a source instruction.
    pub origin: Option<Point>,
}

impl Taint {
    pub fn at(kind: impl Into<String>, origin: Point) -> Self {
        Self {
            label: TaintLabel::new(kind),
            origin: Some(origin),
        }
    }

    pub fn synthetic(kind: impl Into<String>) -> Self {
        Self {
            label: TaintLabel::new(kind),
            origin: None,
        }
    }
}

/// A source-kind/sink-kind pairing. A flow is only reported when some rule
/// connects the flowing label to the sink it reaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub code: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub sources: BTreeSet<String>,
    pub sinks: BTreeSet<String>,
}

/// The active rule set for an analysis run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Rules connecting `source_kind` to `sink_kind`.
    pub fn rules_matching<'a>(
        &'a self,
        source_kind: &'a str,
        sink_kind: &'a str,
    ) -> impl Iterator<Item = &'a Rule> {
        self.rules.iter().filter(move |r| {
            r.sources.contains(source_kind) && r.sinks.contains(sink_kind)
        })
    }

    /// Whether any rule declares `kind` as a source.
    pub fn knows_source(&self, kind: &str) -> bool {
        self.rules.iter().any(|r| r.sources.contains(kind))
    }

    /// Whether any rule declares `kind` as a sink.
    pub fn knows_sink(&self, kind: &str) -> bool {
        self.rules.iter().any(|r| r.sinks.contains(kind))
    }

    /// Parse a rule set from its JSON representation.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`serde_json::Error`] on malformed input.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Every declared source kind, deduplicated and ordered.
    pub fn source_kinds(&self) -> BTreeSet<&str> {
        self.rules
            .iter()
            .flat_map(|r| r.sources.iter().map(String::as_str))
            .collect()
    }
}

// ============================================================================
// Environments
// ============================================================================

/// A storage location taint attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    /// A frame-local variable.
    Var(VarId),
    /// A shared capture cell.
    Cell(CellId),
    /// A by-value snapshot slot of one closure value.
    Field(ClosureId, usize),
}

/// Map from storage locations to the taint they hold at one program point.
///
/// Assignment overwrites (the old set is replaced, never unioned); only
/// control-flow joins union.
#[derive(Debug, Clone, Default)]
pub struct TaintEnvironment {
    taints: FxHashMap<Target, BTreeSet<Taint>>,
}

impl TaintEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the taint of `target` with exactly `taints`. An empty set
    /// clears the entry, so overwriting with a clean value removes taint.
    pub fn overwrite(&mut self, target: Target, taints: BTreeSet<Taint>) {
        if taints.is_empty() {
            self.taints.remove(&target);
        } else {
            self.taints.insert(target, taints);
        }
    }

    /// Add `taints` to whatever `target` already holds (weak update).
    pub fn union_into(&mut self, target: Target, taints: &BTreeSet<Taint>) {
        if taints.is_empty() {
            return;
        }
        self.taints.entry(target).or_default().extend(taints.iter().cloned());
    }

    /// The taint currently held by `target`.
    pub fn taints(&self, target: Target) -> &BTreeSet<Taint> {
        static EMPTY: BTreeSet<Taint> = BTreeSet::new();
        self.taints.get(&target).unwrap_or(&EMPTY)
    }

    pub fn is_tainted(&self, target: Target) -> bool {
        self.taints.contains_key(&target)
    }

    /// Pointwise union of `other` into `self`, for control-flow joins.
    pub fn merge(&mut self, other: &TaintEnvironment) {
        for (target, taints) in &other.taints {
            self.union_into(*target, taints);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.taints.is_empty()
    }

    /// Entries in deterministic order, for reporting.
    pub fn iter_sorted(&self) -> Vec<(Target, &BTreeSet<Taint>)> {
        let mut entries: Vec<_> = self.taints.iter().map(|(t, s)| (*t, s)).collect();
        entries.sort_by_key(|(t, _)| *t);
        entries
    }
}

impl PartialEq for TaintEnvironment {
    fn eq(&self, other: &Self) -> bool {
        self.taints == other.taints
    }
}

impl Eq for TaintEnvironment {}

// ============================================================================
// Findings
// ============================================================================

/// One source-to-sink flow witnessed by propagation.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Finding {
    pub rule: u32,
    /// The sink callee, e.g. `"Origin.sink"`.
    pub callee: String,
    pub source_kind: String,
    pub sink_kind: String,
    /// Where the taint entered; `None` when it came from a synthetic seed.
    pub source_point: Option<Point>,
    pub sink_point: Point,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rule {}: {} -> {} at {}({})",
            self.rule, self.source_kind, self.sink_kind, self.callee, self.sink_point
        )?;
        if let Some(origin) = &self.source_point {
            write!(f, " from {origin}")?;
        }
        Ok(())
    }
}
