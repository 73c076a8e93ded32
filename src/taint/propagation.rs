//! Forward taint propagation over a method graph.
//!
//! The engine runs a monotone fixed point over the method body's CFG,
//! block-level, in topological order with back edges re-queued until the
//! out-environments stabilize. Closure invocations do not re-analyze bodies:
//! each call instantiates the closure unit's memoized symbolic summary
//! against the environment at the call point, so results are identical to
//! inlining while each body is summarized once.
//!
//! Assignments overwrite. Only control-flow joins union. A variable captured
//! by reference has no taint of its own; every read and write of it routes
//! through its shared cell, which is how a mutation inside an invoked
//! closure becomes visible to the frame afterwards.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::capture::{CaptureDiagnostic, CaptureModel, CaptureResolution};
use crate::closure::{ClosureRegistry, ClosureUnit, SummaryTaint, UnitTarget};
use crate::error::AnalysisError;
use crate::ir::types::{
    BlockId, ClosureId, GraphRef, Instr, Method, Operand, Place, Point, VarId,
};
use crate::taint::types::{
    Finding, RuleSet, Taint, Target, TaintEnvironment, UNKNOWN_CALLER_SINK,
};

/// Bounds on the fixed-point computation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropagationConfig {
    /// Iteration cap; `None` derives one from the method size.
    pub max_iterations: Option<usize>,
    /// Wall-clock cap for one method.
    pub timeout: Option<Duration>,
}

/// The result of analyzing one method.
#[derive(Debug, Clone, Default)]
pub struct MethodAnalysis {
    /// Taint environment immediately before each reachable program point,
    /// including points inside invoked closure bodies.
    pub environments: FxHashMap<Point, TaintEnvironment>,
    /// Source-to-sink flows, deduplicated and in deterministic order.
    pub findings: Vec<Finding>,
    /// Capture resolution problems carried through from the resolver.
    pub diagnostics: Vec<CaptureDiagnostic>,
}

/// Forward propagation engine for one method.
pub struct PropagationEngine<'a> {
    method: &'a Method,
    captures: &'a CaptureModel,
    registry: &'a ClosureRegistry,
    rules: &'a RuleSet,
    config: PropagationConfig,
}

impl<'a> PropagationEngine<'a> {
    pub fn new(
        method: &'a Method,
        captures: &'a CaptureModel,
        registry: &'a ClosureRegistry,
        rules: &'a RuleSet,
        config: PropagationConfig,
    ) -> Self {
        Self {
            method,
            captures,
            registry,
            rules,
            config,
        }
    }

    /// Run to a fixed point and produce findings and per-point environments.
    ///
    /// # Errors
    ///
    /// [`AnalysisError::FixedPointTimeout`] if the iteration or wall-clock
    /// bound is exceeded before stabilization.
    pub fn analyze(&self) -> Result<MethodAnalysis, AnalysisError> {
        let started = Instant::now();
        let cfg = &self.method.cfg;
        let order = cfg.topological_order();
        let max_iterations = self.config.max_iterations.unwrap_or_else(|| {
            8 + self.method.total_points() * (self.rules.source_kinds().len() + 2)
        });

        let entry_env = self.entry_env();
        let mut out_envs: HashMap<BlockId, TaintEnvironment> = HashMap::new();

        let mut iterations = 0usize;
        loop {
            let mut changed = false;
            for &block_id in &order {
                let mut env = self.block_in(&entry_env, &out_envs, block_id);
                for (index, instr) in cfg.blocks[&block_id].instrs.iter().enumerate() {
                    let point = Point {
                        graph: GraphRef::Method,
                        block: block_id,
                        index,
                    };
                    self.transfer(&mut env, instr, point);
                }
                if out_envs.get(&block_id) != Some(&env) {
                    out_envs.insert(block_id, env);
                    changed = true;
                }
            }
            iterations += 1;
            trace!(method = %self.method.name, iterations, "fixed-point sweep");
            if !changed {
                break;
            }
            let overtime = self
                .config
                .timeout
                .is_some_and(|limit| started.elapsed() > limit);
            if iterations > max_iterations || overtime {
                return Err(AnalysisError::FixedPointTimeout {
                    method: self.method.name.clone(),
                    iterations,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
        debug!(
            method = %self.method.name,
            iterations,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fixed point reached"
        );

        // Stable: one reporting pass collecting environments and findings.
        let mut analysis = MethodAnalysis {
            diagnostics: self.captures.diagnostics().to_vec(),
            ..MethodAnalysis::default()
        };
        for &block_id in &order {
            let mut env = self.block_in(&entry_env, &out_envs, block_id);
            for (index, instr) in cfg.blocks[&block_id].instrs.iter().enumerate() {
                let point = Point {
                    graph: GraphRef::Method,
                    block: block_id,
                    index,
                };
                analysis.environments.insert(point, env.clone());
                self.report(&env, instr, point, &mut analysis);
                self.transfer(&mut env, instr, point);
            }
        }

        // Taint still held in cells shared with escaped closures is
        // reachable by whoever invokes them later.
        let mut exit_env = TaintEnvironment::new();
        for exit in &cfg.exits {
            if let Some(out) = out_envs.get(exit) {
                exit_env.merge(out);
            }
        }
        for id in self.registry.escaped() {
            self.escape_findings(&exit_env, self.registry.unit(*id), &mut analysis);
        }

        analysis.findings.sort();
        analysis.findings.dedup();
        Ok(analysis)
    }

    /// Environment at method entry: empty except for unresolved-capture
    /// cells, which are seeded with every declared source kind so unknown
    /// bindings stay visibly over-approximated.
    fn entry_env(&self) -> TaintEnvironment {
        let mut env = TaintEnvironment::new();
        for cell in self.captures.unresolved_cells() {
            let seeds: BTreeSet<Taint> = self
                .rules
                .source_kinds()
                .into_iter()
                .map(Taint::synthetic)
                .collect();
            env.overwrite(Target::Cell(*cell), seeds);
        }
        env
    }

    fn block_in(
        &self,
        entry_env: &TaintEnvironment,
        out_envs: &HashMap<BlockId, TaintEnvironment>,
        block: BlockId,
    ) -> TaintEnvironment {
        let cfg = &self.method.cfg;
        let mut env = if block == cfg.entry {
            entry_env.clone()
        } else {
            TaintEnvironment::new()
        };
        for pred in cfg.predecessors(block) {
            if let Some(out) = out_envs.get(pred) {
                env.merge(out);
            }
        }
        env
    }

    /// Where reads and writes of a method-body variable land: its shared
    /// cell when some closure captures it by reference, itself otherwise.
    fn route(&self, var: VarId) -> Target {
        match self.captures.cell_for(var) {
            Some(cell) => Target::Cell(cell),
            None => Target::Var(var),
        }
    }

    fn read(&self, env: &TaintEnvironment, operand: &Operand) -> BTreeSet<Taint> {
        match operand {
            Operand::Var(v) => env.taints(self.route(*v)).clone(),
            // Free names are a closure-body construct; in the method body
            // they read as clean.
            Operand::Free(_) => BTreeSet::new(),
            Operand::Const => BTreeSet::new(),
        }
    }

    /// Concrete taint a symbolic summary value denotes at a call point.
    fn instantiate(
        &self,
        env: &TaintEnvironment,
        unit: ClosureId,
        taint: &SummaryTaint,
    ) -> BTreeSet<Taint> {
        let mut concrete: BTreeSet<Taint> = taint.labels.clone();
        for input in &taint.inputs {
            let target = match input {
                UnitTarget::Cell(cell) => Target::Cell(*cell),
                UnitTarget::Field(index) => Target::Field(unit, *index),
                // Locals start clean and never appear as summary inputs.
                UnitTarget::Var(_) => continue,
            };
            concrete.extend(env.taints(target).iter().cloned());
        }
        concrete
    }

    /// Apply one instruction's effect to the environment.
    fn transfer(&self, env: &mut TaintEnvironment, instr: &Instr, point: Point) {
        match instr {
            Instr::Assign { target, value } => {
                let taints = self.read(env, value);
                if let Place::Var(v) = target {
                    env.overwrite(self.route(*v), taints);
                }
            }
            Instr::Source { target, kind } => {
                if let Place::Var(v) = target {
                    env.overwrite(
                        self.route(*v),
                        BTreeSet::from([Taint::at(kind.clone(), point)]),
                    );
                }
            }
            Instr::Sink { .. } => {}
            Instr::CreateClosure { target, closure } => {
                let unit = self.registry.unit(*closure);
                // Snapshot by-value captures into the unit's field slots.
                for binding in &unit.bindings {
                    if let CaptureResolution::ByValue { outer } = &binding.resolution {
                        let taints = env.taints(self.route(*outer)).clone();
                        env.overwrite(Target::Field(*closure, binding.index), taints);
                    }
                }
                // The closure value itself is clean.
                env.overwrite(self.route(*target), BTreeSet::new());
            }
            Instr::Invoke { result, closure } => {
                let dispatch = self.registry.targets(*closure);
                let strong = dispatch.len() == 1;
                // Instantiate against the pre-call environment, then apply:
                // a cell's new value may pass its old value through.
                let mut cell_updates: Vec<(Target, BTreeSet<Taint>)> = Vec::new();
                let mut ret_taints: BTreeSet<Taint> = BTreeSet::new();
                for id in dispatch {
                    let unit = self.registry.unit(*id);
                    for (cell, taint) in &unit.summary.cell_exits {
                        cell_updates.push((
                            Target::Cell(*cell),
                            self.instantiate(env, *id, taint),
                        ));
                    }
                    ret_taints.extend(self.instantiate(env, *id, &unit.summary.ret));
                }
                for (target, taints) in cell_updates {
                    if strong {
                        env.overwrite(target, taints);
                    } else {
                        env.union_into(target, &taints);
                    }
                }
                if let Some(result) = result {
                    env.overwrite(self.route(*result), ret_taints);
                }
            }
            Instr::Escape { .. } => {}
            Instr::Return { .. } => {}
        }
    }

    /// Emit findings and closure-internal environments for one instruction,
    /// given the environment just before it.
    fn report(
        &self,
        env: &TaintEnvironment,
        instr: &Instr,
        point: Point,
        analysis: &mut MethodAnalysis,
    ) {
        match instr {
            Instr::Sink { callee, kind, arg } => {
                for taint in &self.read(env, arg) {
                    self.emit(callee, taint, kind, point, &mut analysis.findings);
                }
            }
            Instr::Invoke { closure, .. } => {
                for id in self.registry.targets(*closure) {
                    let unit = self.registry.unit(*id);
                    for reach in &unit.summary.sinks {
                        for taint in &self.instantiate(env, *id, &reach.taint) {
                            self.emit(
                                &reach.callee,
                                taint,
                                &reach.sink_kind,
                                reach.point,
                                &mut analysis.findings,
                            );
                        }
                    }
                    for (inner_point, entries) in &unit.summary.point_taints {
                        let inner = analysis
                            .environments
                            .entry(*inner_point)
                            .or_default();
                        for (target, taint) in entries {
                            let concrete = self.instantiate(env, *id, taint);
                            let inner_target = match target {
                                UnitTarget::Var(v) => Target::Var(*v),
                                UnitTarget::Cell(c) => Target::Cell(*c),
                                UnitTarget::Field(i) => Target::Field(*id, *i),
                            };
                            inner.union_into(inner_target, &concrete);
                        }
                    }
                }
            }
            Instr::Escape { closure } => {
                for id in self.registry.targets(*closure) {
                    self.escape_findings(env, self.registry.unit(*id), analysis);
                }
            }
            _ => {}
        }
    }

    /// Findings for a sink hit: one per rule pairing the label's kind with
    /// the sink's kind.
    fn emit(
        &self,
        callee: &str,
        taint: &Taint,
        sink_kind: &str,
        sink_point: Point,
        findings: &mut Vec<Finding>,
    ) {
        for rule in self.rules.rules_matching(taint.label.kind(), sink_kind) {
            findings.push(Finding {
                rule: rule.code,
                callee: callee.to_string(),
                source_kind: taint.label.kind().to_string(),
                sink_kind: sink_kind.to_string(),
                source_point: taint.origin,
                sink_point,
            });
        }
    }

    /// An escaped closure may be invoked by an unknown external caller, so
    /// taint in its shared cells conservatively reaches an unknown sink.
    fn escape_findings(
        &self,
        env: &TaintEnvironment,
        unit: &ClosureUnit,
        analysis: &mut MethodAnalysis,
    ) {
        for binding in &unit.bindings {
            let Some(cell) = binding.resolution.cell() else {
                continue;
            };
            for taint in env.taints(Target::Cell(cell)) {
                for rule in &self.rules.rules {
                    if !rule.sources.contains(taint.label.kind()) {
                        continue;
                    }
                    analysis.findings.push(Finding {
                        rule: rule.code,
                        callee: "unknown external caller".to_string(),
                        source_kind: taint.label.kind().to_string(),
                        sink_kind: UNKNOWN_CALLER_SINK.to_string(),
                        source_point: taint.origin,
                        sink_point: Point {
                            graph: GraphRef::Closure(unit.id),
                            block: self.method.closure(unit.id).cfg.entry,
                            index: 0,
                        },
                    });
                }
            }
        }
    }
}
