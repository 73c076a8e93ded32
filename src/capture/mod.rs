//! Closure-capture resolution.
//!
//! Every free name in a closure body is bound, before propagation starts, to
//! one of three resolutions:
//!
//! - **by value**: the closure gets a private snapshot slot, filled from the
//!   outer variable at closure-creation time;
//! - **by reference**: the closure shares a mutable cell with the enclosing
//!   frame. Exactly one cell exists per outer variable, no matter how many
//!   closures capture it;
//! - **unresolved**: the name does not bind to any enclosing variable. The
//!   capture degrades to a shared cell that propagation seeds with every
//!   source kind the active rules declare, so the imprecision stays visible
//!   in the results instead of silently dropping flows.
//!
//! Which of the first two applies is a policy decision, mirroring how JVM
//! languages box mutable captured locals while copying immutable ones.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ir::types::{ClosureId, Instr, Method, Operand, Place, VarId, VarInfo};

// ============================================================================
// Policy
// ============================================================================

/// How a resolved capture is modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureMode {
    /// Private snapshot taken when the closure value is created.
    ByValue,
    /// Shared mutable cell, visible to the frame and to every capturing
    /// closure.
    ByReference,
}

/// Source-language capture convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CapturePolicy {
    /// Mutable locals are boxed and shared; immutable locals are copied.
    /// This is the Kotlin/Java convention and the default.
    #[default]
    BoxedMutable,
    /// Every capture copies, mutable or not.
    Snapshot,
}

impl CapturePolicy {
    /// The capture mode this policy assigns to `var`.
    pub fn mode_for(self, var: &VarInfo) -> CaptureMode {
        match self {
            CapturePolicy::BoxedMutable if var.mutable => CaptureMode::ByReference,
            CapturePolicy::BoxedMutable => CaptureMode::ByValue,
            CapturePolicy::Snapshot => CaptureMode::ByValue,
        }
    }
}

// ============================================================================
// Resolutions
// ============================================================================

/// Identifier of a shared capture cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(pub usize);

/// How one free name in one closure body was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureResolution {
    ByValue { outer: VarId },
    ByReference { outer: VarId, cell: CellId },
    /// No enclosing binding was found; reads of the name observe a cell
    /// pre-seeded with every declared source kind.
    Unresolved { cell: CellId },
}

impl CaptureResolution {
    /// The effective capture mode; unresolved captures behave by-reference.
    pub fn mode(&self) -> CaptureMode {
        match self {
            CaptureResolution::ByValue { .. } => CaptureMode::ByValue,
            CaptureResolution::ByReference { .. } | CaptureResolution::Unresolved { .. } => {
                CaptureMode::ByReference
            }
        }
    }

    /// The shared cell, if this resolution has one.
    pub fn cell(&self) -> Option<CellId> {
        match self {
            CaptureResolution::ByValue { .. } => None,
            CaptureResolution::ByReference { cell, .. }
            | CaptureResolution::Unresolved { cell } => Some(*cell),
        }
    }
}

/// One captured name of one closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureBinding {
    pub name: String,
    /// Position among the closure's captures; by-value snapshots use this as
    /// their field slot.
    pub index: usize,
    pub resolution: CaptureResolution,
}

/// A capture that failed to resolve, kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDiagnostic {
    pub closure: ClosureId,
    pub name: String,
}

// ============================================================================
// Model
// ============================================================================

/// The resolved capture structure of one method.
#[derive(Debug, Clone, Default)]
pub struct CaptureModel {
    bindings: FxHashMap<ClosureId, Vec<CaptureBinding>>,
    /// Outer variable -> its shared cell, for variables captured by
    /// reference by at least one closure.
    cell_of: FxHashMap<VarId, CellId>,
    cell_count: usize,
    unresolved_seeded: Vec<CellId>,
    diagnostics: Vec<CaptureDiagnostic>,
}

impl CaptureModel {
    /// Resolve every free name of every closure in `method` under `policy`.
    pub fn resolve(method: &Method, policy: CapturePolicy) -> Self {
        let mut cell_of: FxHashMap<VarId, CellId> = FxHashMap::default();
        // Shared cells for unresolved names, keyed by name so two closures
        // referencing the same unknown binding observe the same cell.
        let mut unresolved_cells: FxHashMap<String, CellId> = FxHashMap::default();
        let mut next_cell = 0usize;
        let mut unresolved_seeded = Vec::new();
        let mut diagnostics = Vec::new();
        let mut all_bindings: FxHashMap<ClosureId, Vec<CaptureBinding>> = FxHashMap::default();

        for def in &method.closures {
            // A parentless closure scope has nothing to resolve against;
            // its names fall through to the unresolved path below.
            let enclosing = method.scope(def.scope).parent;
            let mut bindings = Vec::new();
            for (index, name) in free_names(def.cfg.blocks_in_order()).into_iter().enumerate() {
                let resolution = match enclosing.and_then(|scope| method.resolve_name(&name, scope))
                {
                    Some(outer) => match policy.mode_for(method.var(outer)) {
                        CaptureMode::ByValue => CaptureResolution::ByValue { outer },
                        CaptureMode::ByReference => {
                            let cell = *cell_of.entry(outer).or_insert_with(|| {
                                let id = CellId(next_cell);
                                next_cell += 1;
                                id
                            });
                            CaptureResolution::ByReference { outer, cell }
                        }
                    },
                    None => {
                        warn!(
                            closure = def.id.0,
                            name = %name,
                            "capture did not resolve; modeling as shared cell with \
                             worst-case taint"
                        );
                        let cell = *unresolved_cells.entry(name.clone()).or_insert_with(|| {
                            let id = CellId(next_cell);
                            next_cell += 1;
                            id
                        });
                        if !unresolved_seeded.contains(&cell) {
                            unresolved_seeded.push(cell);
                        }
                        diagnostics.push(CaptureDiagnostic {
                            closure: def.id,
                            name: name.clone(),
                        });
                        CaptureResolution::Unresolved { cell }
                    }
                };
                bindings.push(CaptureBinding {
                    name,
                    index,
                    resolution,
                });
            }
            all_bindings.insert(def.id, bindings);
        }

        CaptureModel {
            bindings: all_bindings,
            cell_of,
            cell_count: next_cell,
            unresolved_seeded,
            diagnostics,
        }
    }

    /// The capture bindings of `closure`, in first-reference order.
    pub fn bindings(&self, closure: ClosureId) -> &[CaptureBinding] {
        self.bindings.get(&closure).map_or(&[], Vec::as_slice)
    }

    /// The shared cell a variable routes through, if any closure captures it
    /// by reference.
    pub fn cell_for(&self, var: VarId) -> Option<CellId> {
        self.cell_of.get(&var).copied()
    }

    /// Total number of shared cells, including unresolved ones.
    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    /// Cells standing in for unresolved captures; seeded at analysis start.
    pub fn unresolved_cells(&self) -> &[CellId] {
        &self.unresolved_seeded
    }

    pub fn diagnostics(&self) -> &[CaptureDiagnostic] {
        &self.diagnostics
    }

    /// The binding a closure has for `name`, if it captures that name.
    pub fn binding(&self, closure: ClosureId, name: &str) -> Option<&CaptureBinding> {
        self.bindings(closure).iter().find(|b| b.name == name)
    }
}

/// Free names referenced by a closure body, deduplicated in first-reference
/// order so capture indices are stable.
fn free_names<'a>(
    blocks: impl Iterator<Item = &'a crate::ir::types::Block>,
) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    };
    for block in blocks {
        for instr in &block.instrs {
            match instr {
                Instr::Assign { target, value } => {
                    if let Place::Free(name) = target {
                        push(name);
                    }
                    if let Operand::Free(name) = value {
                        push(name);
                    }
                }
                Instr::Source { target, .. } => {
                    if let Place::Free(name) = target {
                        push(name);
                    }
                }
                Instr::Sink { arg, .. } => {
                    if let Operand::Free(name) = arg {
                        push(name);
                    }
                }
                Instr::Return { value } => {
                    if let Some(Operand::Free(name)) = value {
                        push(name);
                    }
                }
                Instr::CreateClosure { .. } | Instr::Invoke { .. } | Instr::Escape { .. } => {}
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::MethodBuilder;
    use crate::ir::types::Operand;

    #[test]
    fn test_mutable_capture_is_by_reference() {
        let mut m = MethodBuilder::new("m");
        let _x = m.declare_mut("x");
        let c = m.closure(|cb| {
            cb.source_free("x", "TestSource");
        });
        let method = m.finish().unwrap();

        let model = CaptureModel::resolve(&method, CapturePolicy::BoxedMutable);
        let bindings = model.bindings(c);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].resolution.mode(), CaptureMode::ByReference);
        assert!(model.diagnostics().is_empty());
    }

    #[test]
    fn test_immutable_capture_is_by_value() {
        let mut m = MethodBuilder::new("m");
        let _x = m.declare("x");
        let c = m.closure(|cb| {
            cb.sink("sink", "TestSink", Operand::Free("x".to_string()));
        });
        let method = m.finish().unwrap();

        let model = CaptureModel::resolve(&method, CapturePolicy::BoxedMutable);
        assert_eq!(model.bindings(c)[0].resolution.mode(), CaptureMode::ByValue);
        assert_eq!(model.cell_count(), 0);
    }

    #[test]
    fn test_snapshot_policy_copies_mutable_vars() {
        let mut m = MethodBuilder::new("m");
        let _x = m.declare_mut("x");
        let c = m.closure(|cb| {
            cb.sink("sink", "TestSink", Operand::Free("x".to_string()));
        });
        let method = m.finish().unwrap();

        let model = CaptureModel::resolve(&method, CapturePolicy::Snapshot);
        assert_eq!(model.bindings(c)[0].resolution.mode(), CaptureMode::ByValue);
    }

    #[test]
    fn test_one_cell_per_variable_across_closures() {
        let mut m = MethodBuilder::new("m");
        let x = m.declare_mut("x");
        let a = m.closure(|cb| {
            cb.source_free("x", "TestSource");
        });
        let b = m.closure(|cb| {
            cb.sink("sink", "TestSink", Operand::Free("x".to_string()));
        });
        let method = m.finish().unwrap();

        let model = CaptureModel::resolve(&method, CapturePolicy::BoxedMutable);
        let cell_a = model.bindings(a)[0].resolution.cell().unwrap();
        let cell_b = model.bindings(b)[0].resolution.cell().unwrap();
        assert_eq!(cell_a, cell_b);
        assert_eq!(model.cell_for(x), Some(cell_a));
        assert_eq!(model.cell_count(), 1);
    }

    #[test]
    fn test_parentless_closure_scope_degrades() {
        // Hand-built graph whose closure scope has no parent; resolution
        // must degrade to unresolved cells instead of panicking.
        use std::collections::HashMap;

        use crate::ir::types::{
            Block, BlockId, Cfg, ClosureDef, ClosureId, Instr, Method, Place, Scope, ScopeId,
            ScopeKind,
        };

        let scope = ScopeId(0);
        let mut blocks = HashMap::new();
        blocks.insert(
            BlockId(0),
            Block {
                id: BlockId(0),
                label: "entry".to_string(),
                instrs: vec![Instr::Source {
                    target: Place::Free("x".to_string()),
                    kind: "TestSource".to_string(),
                }],
            },
        );
        let method = Method {
            name: "m".to_string(),
            scopes: vec![Scope {
                id: scope,
                kind: ScopeKind::Closure(ClosureId(0)),
                parent: None,
            }],
            vars: Vec::new(),
            closures: vec![ClosureDef {
                id: ClosureId(0),
                scope,
                cfg: Cfg::new(blocks, Vec::new(), BlockId(0), vec![BlockId(0)]),
            }],
            cfg: Cfg::new(
                {
                    let mut m = HashMap::new();
                    m.insert(
                        BlockId(0),
                        Block {
                            id: BlockId(0),
                            label: "entry".to_string(),
                            instrs: Vec::new(),
                        },
                    );
                    m
                },
                Vec::new(),
                BlockId(0),
                vec![BlockId(0)],
            ),
            method_scope: scope,
        };

        let model = CaptureModel::resolve(&method, CapturePolicy::BoxedMutable);
        let binding = &model.bindings(ClosureId(0))[0];
        assert!(matches!(
            binding.resolution,
            CaptureResolution::Unresolved { .. }
        ));
        assert_eq!(model.diagnostics().len(), 1);
    }

    #[test]
    fn test_unknown_name_degrades_with_diagnostic() {
        let mut m = MethodBuilder::new("m");
        let c = m.closure(|cb| {
            cb.sink("sink", "TestSink", Operand::Free("phantom".to_string()));
        });
        let method = m.finish().unwrap();

        let model = CaptureModel::resolve(&method, CapturePolicy::BoxedMutable);
        let binding = &model.bindings(c)[0];
        assert!(matches!(
            binding.resolution,
            CaptureResolution::Unresolved { .. }
        ));
        assert_eq!(binding.resolution.mode(), CaptureMode::ByReference);
        assert_eq!(model.unresolved_cells().len(), 1);
        assert_eq!(model.diagnostics().len(), 1);
        assert_eq!(model.diagnostics()[0].name, "phantom");
    }
}
