//! Synthetic callables for closure bodies.
//!
//! Each closure *definition* gets exactly one [`ClosureUnit`], carrying a
//! symbolic summary of its body computed once when the registry is built.
//! The summary speaks in terms of the unit's entry locations (capture cells
//! and by-value snapshot slots) rather than concrete taint, so a single
//! summary instantiates exactly against the environment of every call site:
//! memoization never costs per-invocation precision.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::capture::{CaptureBinding, CaptureModel, CaptureResolution, CellId};
use crate::error::AnalysisError;
use crate::ir::types::{
    BlockId, ClosureId, GraphRef, Instr, Method, Operand, Place, Point, VarId,
};

// ============================================================================
// Symbolic domain
// ============================================================================

/// A storage location as seen from inside one closure unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitTarget {
    /// A local of the closure body.
    Var(VarId),
    /// A shared capture cell, the same cell the enclosing frame sees.
    Cell(CellId),
    /// A by-value snapshot slot, indexed by capture position.
    Field(usize),
}

/// Symbolic taint: labels the body generates itself, plus entry locations
/// whose incoming taint flows through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryTaint {
    pub labels: BTreeSet<crate::taint::types::Taint>,
    pub inputs: BTreeSet<UnitTarget>,
}

impl SummaryTaint {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.inputs.is_empty()
    }

    fn union(&mut self, other: &SummaryTaint) {
        self.labels.extend(other.labels.iter().cloned());
        self.inputs.extend(other.inputs.iter().copied());
    }

    fn of_input(target: UnitTarget) -> Self {
        Self {
            labels: BTreeSet::new(),
            inputs: BTreeSet::from([target]),
        }
    }
}

/// Symbolic environment over unit targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SymbolicEnv {
    map: BTreeMap<UnitTarget, SummaryTaint>,
}

impl SymbolicEnv {
    fn get(&self, target: UnitTarget) -> SummaryTaint {
        self.map.get(&target).cloned().unwrap_or_default()
    }

    fn overwrite(&mut self, target: UnitTarget, taint: SummaryTaint) {
        if taint.is_empty() {
            self.map.remove(&target);
        } else {
            self.map.insert(target, taint);
        }
    }

    fn merge(&mut self, other: &SymbolicEnv) {
        for (target, taint) in &other.map {
            self.map.entry(*target).or_default().union(taint);
        }
    }
}

// ============================================================================
// Summaries
// ============================================================================

/// A sink instruction inside the unit, with the symbolic taint reaching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkReach {
    pub point: Point,
    pub callee: String,
    pub sink_kind: String,
    pub taint: SummaryTaint,
}

/// What one execution of the closure body does, independent of call site.
#[derive(Debug, Clone, Default)]
pub struct ClosureSummary {
    /// Final value of each shared cell the body writes or reads.
    pub cell_exits: BTreeMap<CellId, SummaryTaint>,
    /// Taint of the returned value, unioned over all return instructions.
    pub ret: SummaryTaint,
    /// Sinks the body itself invokes.
    pub sinks: Vec<SinkReach>,
    /// Symbolic taint at each instruction of the body, for reporting.
    pub point_taints: Vec<(Point, Vec<(UnitTarget, SummaryTaint)>)>,
}

/// One synthetic callable: a closure definition plus its memoized summary.
#[derive(Debug, Clone)]
pub struct ClosureUnit {
    pub id: ClosureId,
    pub bindings: Vec<CaptureBinding>,
    pub summary: ClosureSummary,
}

// ============================================================================
// Registry
// ============================================================================

/// All closure units of one method, plus which variables may hold which
/// closure values and which closures escape the method.
#[derive(Debug, Clone)]
pub struct ClosureRegistry {
    units: Vec<ClosureUnit>,
    dispatch: FxHashMap<VarId, BTreeSet<ClosureId>>,
    escaped: BTreeSet<ClosureId>,
}

impl ClosureRegistry {
    /// Build units for every closure in `method`, summarizing each body
    /// exactly once.
    pub fn build(method: &Method, captures: &CaptureModel) -> Result<Self, AnalysisError> {
        let dispatch = dispatch_map(method);
        let escaped = escaped_closures(method, &dispatch);

        let mut units = Vec::with_capacity(method.closures.len());
        for def in &method.closures {
            let bindings = captures.bindings(def.id).to_vec();
            let summary = summarize(method, def.id, &bindings)?;
            debug!(
                closure = def.id.0,
                captures = bindings.len(),
                sinks = summary.sinks.len(),
                "closure unit summarized"
            );
            units.push(ClosureUnit {
                id: def.id,
                bindings,
                summary,
            });
        }
        Ok(Self {
            units,
            dispatch,
            escaped,
        })
    }

    pub fn unit(&self, id: ClosureId) -> &ClosureUnit {
        &self.units[id.0]
    }

    pub fn units(&self) -> &[ClosureUnit] {
        &self.units
    }

    /// Closures a variable may hold at any point in the method.
    pub fn targets(&self, var: VarId) -> &BTreeSet<ClosureId> {
        static EMPTY: BTreeSet<ClosureId> = BTreeSet::new();
        self.dispatch.get(&var).unwrap_or(&EMPTY)
    }

    pub fn is_escaped(&self, id: ClosureId) -> bool {
        self.escaped.contains(&id)
    }

    pub fn escaped(&self) -> &BTreeSet<ClosureId> {
        &self.escaped
    }
}

/// Flow-insensitive map from variables to the closure values they may hold.
/// Assignments copy sets; the small fixed point handles chains like
/// `a = closure; b = a; c = b`.
fn dispatch_map(method: &Method) -> FxHashMap<VarId, BTreeSet<ClosureId>> {
    let mut map: FxHashMap<VarId, BTreeSet<ClosureId>> = FxHashMap::default();
    loop {
        let mut changed = false;
        for block in method.cfg.blocks_in_order() {
            for instr in &block.instrs {
                match instr {
                    Instr::CreateClosure { target, closure } => {
                        changed |= map.entry(*target).or_default().insert(*closure);
                    }
                    Instr::Assign {
                        target: Place::Var(target),
                        value: Operand::Var(value),
                    } => {
                        let sources = map.get(value).cloned().unwrap_or_default();
                        if !sources.is_empty() {
                            let entry = map.entry(*target).or_default();
                            let before = entry.len();
                            entry.extend(sources);
                            changed |= entry.len() != before;
                        }
                    }
                    _ => {}
                }
            }
        }
        if !changed {
            return map;
        }
    }
}

/// Closures whose values leave the method, through an escape instruction or
/// by being returned.
fn escaped_closures(
    method: &Method,
    dispatch: &FxHashMap<VarId, BTreeSet<ClosureId>>,
) -> BTreeSet<ClosureId> {
    let mut escaped = BTreeSet::new();
    for block in method.cfg.blocks_in_order() {
        for instr in &block.instrs {
            let var = match instr {
                Instr::Escape { closure } => Some(*closure),
                Instr::Return {
                    value: Some(Operand::Var(v)),
                } => Some(*v),
                _ => None,
            };
            if let Some(var) = var {
                if let Some(ids) = dispatch.get(&var) {
                    escaped.extend(ids.iter().copied());
                }
            }
        }
    }
    escaped
}

// ============================================================================
// Summarization
// ============================================================================

/// The unit location a free name maps to. `None` only when the capture
/// model does not belong to this method's closures; the mismatch is logged
/// and the access becomes a no-op rather than a panic.
fn binding_target(bindings: &[CaptureBinding], name: &str) -> Option<UnitTarget> {
    let Some(binding) = bindings.iter().find(|b| b.name == name) else {
        warn!(name = %name, "free name has no capture binding; ignoring access");
        return None;
    };
    Some(match &binding.resolution {
        CaptureResolution::ByValue { .. } => UnitTarget::Field(binding.index),
        CaptureResolution::ByReference { cell, .. }
        | CaptureResolution::Unresolved { cell } => UnitTarget::Cell(*cell),
    })
}

fn read_operand(
    env: &SymbolicEnv,
    bindings: &[CaptureBinding],
    operand: &Operand,
) -> SummaryTaint {
    match operand {
        Operand::Var(v) => env.get(UnitTarget::Var(*v)),
        Operand::Free(name) => binding_target(bindings, name)
            .map(|target| env.get(target))
            .unwrap_or_default(),
        Operand::Const => SummaryTaint::default(),
    }
}

fn write_place(bindings: &[CaptureBinding], place: &Place) -> Option<UnitTarget> {
    match place {
        Place::Var(v) => Some(UnitTarget::Var(*v)),
        Place::Free(name) => binding_target(bindings, name),
    }
}

/// Run the body of `closure` to a fixed point in the symbolic domain.
fn summarize(
    method: &Method,
    closure: ClosureId,
    bindings: &[CaptureBinding],
) -> Result<ClosureSummary, AnalysisError> {
    let cfg = &method.closure(closure).cfg;
    let graph = GraphRef::Closure(closure);

    // Entry: every capture location flows itself.
    let mut entry_env = SymbolicEnv::default();
    for binding in bindings {
        let target = match &binding.resolution {
            CaptureResolution::ByValue { .. } => UnitTarget::Field(binding.index),
            CaptureResolution::ByReference { cell, .. }
            | CaptureResolution::Unresolved { cell } => UnitTarget::Cell(*cell),
        };
        entry_env.overwrite(target, SummaryTaint::of_input(target));
    }

    let order = cfg.topological_order();
    let mut out_envs: BTreeMap<BlockId, SymbolicEnv> = BTreeMap::new();
    let max_iterations = 8 + cfg.point_count() * (bindings.len() + 2);

    let block_in = |out_envs: &BTreeMap<BlockId, SymbolicEnv>, block: BlockId| {
        let mut env = if block == cfg.entry {
            entry_env.clone()
        } else {
            SymbolicEnv::default()
        };
        for pred in cfg.predecessors(block) {
            if let Some(out) = out_envs.get(pred) {
                env.merge(out);
            }
        }
        env
    };

    let mut iterations = 0usize;
    loop {
        let mut changed = false;
        for &block_id in &order {
            let mut env = block_in(&out_envs, block_id);
            for (index, instr) in cfg.blocks[&block_id].instrs.iter().enumerate() {
                apply(&mut env, bindings, instr, graph, block_id, index, None);
            }
            if out_envs.get(&block_id) != Some(&env) {
                out_envs.insert(block_id, env);
                changed = true;
            }
        }
        iterations += 1;
        if !changed {
            break;
        }
        if iterations > max_iterations {
            return Err(AnalysisError::FixedPointTimeout {
                method: format!("{}::closure#{}", method.name, closure.0),
                iterations,
                elapsed_ms: 0,
            });
        }
    }

    // Stable: one reporting pass collecting sinks, returns, and per-point
    // environments.
    let mut summary = ClosureSummary::default();
    for &block_id in &order {
        let mut env = block_in(&out_envs, block_id);
        for (index, instr) in cfg.blocks[&block_id].instrs.iter().enumerate() {
            let point = Point {
                graph,
                block: block_id,
                index,
            };
            summary.point_taints.push((
                point,
                env.map.iter().map(|(t, s)| (*t, s.clone())).collect(),
            ));
            apply(&mut env, bindings, instr, graph, block_id, index, Some(&mut summary));
        }
    }

    // Cell state at exit: merge of all exit-block out-environments.
    let mut exit_env = SymbolicEnv::default();
    for exit in &cfg.exits {
        if let Some(out) = out_envs.get(exit) {
            exit_env.merge(out);
        }
    }
    for (target, taint) in &exit_env.map {
        if let UnitTarget::Cell(cell) = target {
            summary.cell_exits.insert(*cell, taint.clone());
        }
    }
    Ok(summary)
}

/// Transfer one instruction in the symbolic domain. When `report` is given,
/// sink reaches and return taint are also recorded.
fn apply(
    env: &mut SymbolicEnv,
    bindings: &[CaptureBinding],
    instr: &Instr,
    graph: GraphRef,
    block: BlockId,
    index: usize,
    report: Option<&mut ClosureSummary>,
) {
    let point = Point {
        graph,
        block,
        index,
    };
    match instr {
        Instr::Assign { target, value } => {
            let taint = read_operand(env, bindings, value);
            if let Some(target) = write_place(bindings, target) {
                env.overwrite(target, taint);
            }
        }
        Instr::Source { target, kind } => {
            if let Some(target) = write_place(bindings, target) {
                env.overwrite(
                    target,
                    SummaryTaint {
                        labels: BTreeSet::from([crate::taint::types::Taint::at(
                            kind.clone(),
                            point,
                        )]),
                        inputs: BTreeSet::new(),
                    },
                );
            }
        }
        Instr::Sink { callee, kind, arg } => {
            if let Some(summary) = report {
                let taint = read_operand(env, bindings, arg);
                if !taint.is_empty() {
                    summary.sinks.push(SinkReach {
                        point,
                        callee: callee.clone(),
                        sink_kind: kind.clone(),
                        taint,
                    });
                }
            }
        }
        Instr::Return { value } => {
            if let (Some(summary), Some(value)) = (report, value) {
                let taint = read_operand(env, bindings, value);
                summary.ret.union(&taint);
            }
        }
        // Closure bodies do not themselves define or invoke closures.
        Instr::CreateClosure { .. } | Instr::Invoke { .. } | Instr::Escape { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureModel, CapturePolicy};
    use crate::ir::builder::MethodBuilder;
    use crate::ir::types::Operand;
    use crate::taint::types::Taint;

    fn build(method: &Method) -> (CaptureModel, ClosureRegistry) {
        let captures = CaptureModel::resolve(method, CapturePolicy::BoxedMutable);
        let registry = ClosureRegistry::build(method, &captures).unwrap();
        (captures, registry)
    }

    #[test]
    fn test_summary_records_cell_write() {
        let mut m = MethodBuilder::new("m");
        let _x = m.declare_mut("x");
        let c = m.closure(|cb| {
            cb.source_free("x", "TestSource");
        });
        let method = m.finish().unwrap();
        let (captures, registry) = build(&method);

        let cell = captures.bindings(c)[0].resolution.cell().unwrap();
        let exit = &registry.unit(c).summary.cell_exits[&cell];
        assert_eq!(exit.labels.len(), 1);
        assert!(exit.inputs.is_empty());
        let taint: Vec<&Taint> = exit.labels.iter().collect();
        assert_eq!(taint[0].label.kind(), "TestSource");
    }

    #[test]
    fn test_summary_return_passes_capture_through() {
        let mut m = MethodBuilder::new("m");
        let _x = m.declare_mut("x");
        let c = m.closure(|cb| {
            let value = cb.free("x");
            cb.ret(Some(value));
        });
        let method = m.finish().unwrap();
        let (captures, registry) = build(&method);

        let cell = captures.bindings(c)[0].resolution.cell().unwrap();
        let ret = &registry.unit(c).summary.ret;
        assert!(ret.labels.is_empty());
        assert_eq!(ret.inputs, BTreeSet::from([UnitTarget::Cell(cell)]));
    }

    #[test]
    fn test_summary_sink_on_by_value_slot() {
        let mut m = MethodBuilder::new("m");
        let _x = m.declare("x");
        let c = m.closure(|cb| {
            cb.sink("sink", "TestSink", Operand::Free("x".to_string()));
        });
        let method = m.finish().unwrap();
        let (_, registry) = build(&method);

        let sinks = &registry.unit(c).summary.sinks;
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[0].sink_kind, "TestSink");
        assert_eq!(sinks[0].taint.inputs, BTreeSet::from([UnitTarget::Field(0)]));
    }

    #[test]
    fn test_missing_binding_is_ignored_not_fatal() {
        // An empty capture model (not produced from this method) leaves the
        // closure's free name unbound; summarization must treat the access
        // as a no-op instead of panicking.
        let mut m = MethodBuilder::new("m");
        let _x = m.declare_mut("x");
        let c = m.closure(|cb| {
            cb.source_free("x", "TestSource");
            cb.sink("sink", "TestSink", Operand::Free("x".to_string()));
        });
        let method = m.finish().unwrap();

        let registry = ClosureRegistry::build(&method, &CaptureModel::default()).unwrap();
        let summary = &registry.unit(c).summary;
        assert!(summary.cell_exits.is_empty());
        assert!(summary.sinks.is_empty());
    }

    #[test]
    fn test_dispatch_follows_assignment_chain() {
        let mut m = MethodBuilder::new("m");
        let c = m.closure(|_| {});
        let a = m.declare("a");
        let b = m.declare("b");
        m.create_closure(a, c);
        m.assign(b, Operand::Var(a));
        m.invoke(b);
        let method = m.finish().unwrap();
        let (_, registry) = build(&method);

        assert_eq!(registry.targets(b), &BTreeSet::from([c]));
        assert!(!registry.is_escaped(c));
    }

    #[test]
    fn test_returned_closure_is_escaped() {
        let mut m = MethodBuilder::new("m");
        let c = m.closure(|_| {});
        let a = m.declare("a");
        m.create_closure(a, c);
        m.ret(Some(Operand::Var(a)));
        let method = m.finish().unwrap();
        let (_, registry) = build(&method);

        assert!(registry.is_escaped(c));
    }
}
