//! Method-graph IR type definitions.
//!
//! The analysis consumes a small pre-built intermediate representation:
//! a method owns a scope chain, a variable arena, a set of closure
//! definitions, and a control flow graph of instruction blocks. Graph
//! construction (normally done by a front end) is emulated by
//! [`crate::ir::builder::MethodBuilder`] for fixtures.
//!
//! Identity rules:
//! - A [`VarId`] is distinct from the variable's textual name; two
//!   variables in different scopes may share a name.
//! - A [`ClosureId`] identifies a closure *definition*, never a call site.
//! - A [`Point`] names a single instruction inside one graph (the method
//!   body or a closure body) and is the unit of environment tracking.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a lexical scope within a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(pub usize);

/// Unique identifier for a variable (storage location), distinct from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub usize);

/// Unique identifier for a closure definition within a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClosureId(pub usize);

/// Unique identifier for a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub usize);

// =============================================================================
// Scopes and Variables
// =============================================================================

/// What kind of callable a scope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// The enclosing method body.
    Method,
    /// The body of a closure definition.
    Closure(ClosureId),
}

/// A lexical scope. Scopes form a chain via `parent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scope {
    pub id: ScopeId,
    pub kind: ScopeKind,
    /// Enclosing scope, `None` for the method scope.
    pub parent: Option<ScopeId>,
}

/// A named storage location declared in some scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarInfo {
    /// Source-level name. Not unique across scopes.
    pub name: String,
    /// Declaring scope.
    pub scope: ScopeId,
    /// Whether the variable can be reassigned. Capture policies that box
    /// mutable locals consult this flag.
    pub mutable: bool,
}

// =============================================================================
// Instructions
// =============================================================================

/// A value read by an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// A variable declared in the current graph's own scope.
    Var(VarId),
    /// A name referring to an enclosing-scope variable. Only legal inside
    /// closure bodies; resolved to a capture binding by the capture resolver.
    Free(String),
    /// An untainted constant (literal, `null`, ...).
    Const,
}

/// A storage location written by an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Place {
    /// A variable in the current graph's own scope.
    Var(VarId),
    /// A free name written from inside a closure body.
    Free(String),
}

/// A single IR instruction.
///
/// The instruction set is deliberately small: it covers exactly the
/// operations the taint engine gives semantics to. Source and sink calls
/// carry their classification kind as an opaque string; pairing them into
/// rules happens later against a [`crate::taint::RuleSet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instr {
    /// `target = value`. Overwrites the target's taint, never unions.
    Assign { target: Place, value: Operand },
    /// `target = <source call>()`: introduces a fresh taint label of `kind`.
    Source { target: Place, kind: String },
    /// `<sink call>(arg)`: flags any taint on `arg` that a rule pairs with `kind`.
    Sink {
        callee: String,
        kind: String,
        arg: Operand,
    },
    /// `target = <closure literal>`: binds a closure value to a variable.
    CreateClosure { target: VarId, closure: ClosureId },
    /// `result = closure_var()`: synchronous invocation of a closure value.
    Invoke {
        result: Option<VarId>,
        closure: VarId,
    },
    /// The closure value held by `closure` leaves the method (stored into a
    /// field, passed to an unanalyzed callee, ...).
    Escape { closure: VarId },
    /// Return from the current graph. Returning a closure-holding variable
    /// from the method body is an escape.
    Return { value: Option<Operand> },
}

// =============================================================================
// Program Points
// =============================================================================

/// Which graph a point belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum GraphRef {
    /// The method body graph.
    Method,
    /// The body graph of a closure unit.
    Closure(ClosureId),
}

/// A single program point: one instruction in one graph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Point {
    pub graph: GraphRef,
    pub block: BlockId,
    /// Instruction index within the block.
    pub index: usize,
}

impl Point {
    #[inline]
    pub fn new(graph: GraphRef, block: BlockId, index: usize) -> Self {
        Self {
            graph,
            block,
            index,
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.graph {
            GraphRef::Method => write!(f, "b{}:{}", self.block.0, self.index),
            GraphRef::Closure(id) => {
                write!(f, "closure#{}:b{}:{}", id.0, self.block.0, self.index)
            }
        }
    }
}

// =============================================================================
// Control Flow Graph
// =============================================================================

/// Errors raised by CFG structural validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CfgError {
    /// Entry block ID does not exist in the blocks map.
    #[error("entry block {0:?} not found in blocks")]
    InvalidEntry(BlockId),

    /// An exit block ID does not exist in the blocks map.
    #[error("exit block {0:?} not found in blocks")]
    InvalidExit(BlockId),

    /// Duplicate block ID was inserted (would silently overwrite).
    #[error("duplicate block ID {0:?}")]
    DuplicateBlockId(BlockId),

    /// An edge references a block that does not exist.
    #[error("edge references non-existent block {0:?}")]
    InvalidEdgeBlock(BlockId),
}

/// A basic block: a label plus a straight-line run of instructions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    /// Human-readable label for diagnostics.
    pub label: String,
    pub instrs: Vec<Instr>,
}

/// Semantic type of a CFG edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Fallthrough or unconditional jump.
    Unconditional,
    /// True branch of a conditional.
    True,
    /// False branch of a conditional.
    False,
    /// Back edge closing a loop.
    Back,
}

/// An edge in the control flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: BlockId,
    pub to: BlockId,
    pub kind: EdgeKind,
}

/// Cached adjacency lists for O(1) successor/predecessor lookups.
///
/// Built lazily on first access; skipped during serialization and rebuilt
/// on demand afterwards.
#[derive(Debug)]
pub struct AdjacencyCache {
    successors: HashMap<BlockId, Vec<BlockId>>,
    predecessors: HashMap<BlockId, Vec<BlockId>>,
}

/// Control flow graph for one method or closure body.
#[derive(Debug, Serialize, Deserialize)]
pub struct Cfg {
    pub blocks: HashMap<BlockId, Block>,
    pub edges: Vec<Edge>,
    pub entry: BlockId,
    pub exits: Vec<BlockId>,
    /// Lazily-built adjacency cache. Treat as internal; use
    /// `OnceCell::new()` when constructing.
    #[serde(skip)]
    pub adjacency_cache: OnceCell<AdjacencyCache>,
}

impl Clone for Cfg {
    fn clone(&self) -> Self {
        Self {
            blocks: self.blocks.clone(),
            edges: self.edges.clone(),
            entry: self.entry,
            exits: self.exits.clone(),
            // Rebuilt lazily if needed.
            adjacency_cache: OnceCell::new(),
        }
    }
}

impl Cfg {
    /// Create a new CFG. The adjacency cache starts empty.
    #[must_use]
    pub fn new(
        blocks: HashMap<BlockId, Block>,
        edges: Vec<Edge>,
        entry: BlockId,
        exits: Vec<BlockId>,
    ) -> Self {
        Self {
            blocks,
            edges,
            entry,
            exits,
            adjacency_cache: OnceCell::new(),
        }
    }

    /// Validate CFG structural invariants.
    ///
    /// # Errors
    ///
    /// - `InvalidEntry` if the entry block is not in `blocks`
    /// - `InvalidExit` if any exit block is not in `blocks`
    /// - `InvalidEdgeBlock` if any edge endpoint is not in `blocks`
    pub fn validate(&self) -> Result<(), CfgError> {
        if !self.blocks.contains_key(&self.entry) {
            return Err(CfgError::InvalidEntry(self.entry));
        }
        for exit in &self.exits {
            if !self.blocks.contains_key(exit) {
                return Err(CfgError::InvalidExit(*exit));
            }
        }
        for edge in &self.edges {
            if !self.blocks.contains_key(&edge.from) {
                return Err(CfgError::InvalidEdgeBlock(edge.from));
            }
            if !self.blocks.contains_key(&edge.to) {
                return Err(CfgError::InvalidEdgeBlock(edge.to));
            }
        }
        Ok(())
    }

    /// Insert a block with duplicate detection.
    ///
    /// # Errors
    ///
    /// Returns `CfgError::DuplicateBlockId` if a block with the same ID
    /// already exists.
    pub fn insert_block(&mut self, block: Block) -> Result<(), CfgError> {
        if self.blocks.contains_key(&block.id) {
            return Err(CfgError::DuplicateBlockId(block.id));
        }
        self.blocks.insert(block.id, block);
        Ok(())
    }

    /// Total number of instructions across all blocks.
    pub fn point_count(&self) -> usize {
        self.blocks.values().map(|b| b.instrs.len()).sum()
    }

    /// Blocks in ascending ID order, for deterministic iteration.
    pub fn blocks_in_order(&self) -> impl Iterator<Item = &Block> {
        let mut ids: Vec<BlockId> = self.blocks.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().map(move |id| &self.blocks[&id])
    }

    fn build_adjacency(&self) -> AdjacencyCache {
        let mut successors: HashMap<BlockId, Vec<BlockId>> =
            HashMap::with_capacity(self.blocks.len());
        let mut predecessors: HashMap<BlockId, Vec<BlockId>> =
            HashMap::with_capacity(self.blocks.len());
        for edge in &self.edges {
            successors.entry(edge.from).or_default().push(edge.to);
            predecessors.entry(edge.to).or_default().push(edge.from);
        }
        AdjacencyCache {
            successors,
            predecessors,
        }
    }

    #[inline]
    fn adjacency(&self) -> &AdjacencyCache {
        self.adjacency_cache.get_or_init(|| self.build_adjacency())
    }

    /// Successors of a block. First call builds the adjacency cache.
    pub fn successors(&self, block: BlockId) -> &[BlockId] {
        self.adjacency()
            .successors
            .get(&block)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Predecessors of a block. First call builds the adjacency cache.
    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        self.adjacency()
            .predecessors
            .get(&block)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Find all back edges using DFS from the entry.
    ///
    /// A back edge targets a block currently on the DFS stack; these close
    /// loops and are excluded from the topological ordering.
    pub fn find_back_edges(&self) -> HashSet<(BlockId, BlockId)> {
        let mut back_edges = HashSet::new();
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        self.back_edges_dfs(self.entry, &mut visited, &mut stack, &mut back_edges);
        back_edges
    }

    fn back_edges_dfs(
        &self,
        node: BlockId,
        visited: &mut HashSet<BlockId>,
        stack: &mut HashSet<BlockId>,
        back_edges: &mut HashSet<(BlockId, BlockId)>,
    ) {
        visited.insert(node);
        stack.insert(node);
        for &succ in self.successors(node) {
            if !visited.contains(&succ) {
                self.back_edges_dfs(succ, visited, stack, back_edges);
            } else if stack.contains(&succ) {
                back_edges.insert((node, succ));
            }
        }
        stack.remove(&node);
    }

    /// Compute a topological ordering of blocks for forward dataflow.
    ///
    /// Uses Kahn's algorithm with back edges excluded so that loops still
    /// yield a valid ordering. Ties are broken by block ID so the result is
    /// deterministic regardless of map iteration order.
    pub fn topological_order(&self) -> Vec<BlockId> {
        let back_edges = self.find_back_edges();

        let mut in_degree: HashMap<BlockId, usize> = HashMap::new();
        for block_id in self.blocks.keys() {
            in_degree.insert(*block_id, 0);
        }
        for edge in &self.edges {
            if !back_edges.contains(&(edge.from, edge.to)) {
                *in_degree.entry(edge.to).or_insert(0) += 1;
            }
        }

        let mut ready: Vec<BlockId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        ready.sort_unstable();
        // Pop order is LIFO; keep the list descending so low IDs come out
        // first.
        ready.reverse();

        let mut result = Vec::with_capacity(self.blocks.len());
        while let Some(block_id) = ready.pop() {
            result.push(block_id);
            let mut unlocked = Vec::new();
            for edge in &self.edges {
                if edge.from == block_id && !back_edges.contains(&(edge.from, edge.to)) {
                    if let Some(deg) = in_degree.get_mut(&edge.to) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 {
                            unlocked.push(edge.to);
                        }
                    }
                }
            }
            unlocked.sort_unstable();
            // Pop order is LIFO; push in reverse so low IDs come out first.
            for id in unlocked.into_iter().rev() {
                ready.push(id);
            }
        }

        result
    }
}

// =============================================================================
// Methods and Closure Definitions
// =============================================================================

/// A closure definition nested in a method.
///
/// Owns its body graph and the scope its locals are declared in. Capture
/// bindings are *not* stored here; they are computed by the capture
/// resolver during graph preparation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosureDef {
    pub id: ClosureId,
    /// Scope of the closure body; its parent is the defining scope.
    pub scope: ScopeId,
    pub cfg: Cfg,
}

/// A fully materialized method: scope chain, variable arena, closure
/// definitions, and the body CFG. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Method {
    /// Fully qualified method name; doubles as the fixture identity.
    pub name: String,
    pub scopes: Vec<Scope>,
    pub vars: Vec<VarInfo>,
    pub closures: Vec<ClosureDef>,
    pub cfg: Cfg,
    /// The method body scope (root of the chain).
    pub method_scope: ScopeId,
}

impl Method {
    /// Look up a variable by ID.
    #[inline]
    pub fn var(&self, id: VarId) -> &VarInfo {
        &self.vars[id.0]
    }

    /// Look up a scope by ID.
    #[inline]
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    /// Look up a closure definition by ID.
    #[inline]
    pub fn closure(&self, id: ClosureId) -> &ClosureDef {
        &self.closures[id.0]
    }

    /// The graph a [`GraphRef`] denotes.
    pub fn graph(&self, graph: GraphRef) -> &Cfg {
        match graph {
            GraphRef::Method => &self.cfg,
            GraphRef::Closure(id) => &self.closure(id).cfg,
        }
    }

    /// Resolve a name starting from `scope` and walking the lexical chain
    /// outward. Returns the first declaration found, or `None` if the name
    /// has no resolvable declaration in any enclosing scope.
    pub fn resolve_name(&self, name: &str, scope: ScopeId) -> Option<VarId> {
        let mut current = Some(scope);
        while let Some(scope_id) = current {
            for (idx, var) in self.vars.iter().enumerate() {
                if var.scope == scope_id && var.name == name {
                    return Some(VarId(idx));
                }
            }
            current = self.scope(scope_id).parent;
        }
        None
    }

    /// Total program points in the method body plus all closure bodies.
    pub fn total_points(&self) -> usize {
        self.cfg.point_count()
            + self
                .closures
                .iter()
                .map(|c| c.cfg.point_count())
                .sum::<usize>()
    }

    /// Validate the body CFG and every closure body CFG.
    pub fn validate(&self) -> Result<(), CfgError> {
        self.cfg.validate()?;
        for closure in &self.closures {
            closure.cfg.validate()?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: usize, instrs: Vec<Instr>) -> Block {
        Block {
            id: BlockId(id),
            label: format!("b{id}"),
            instrs,
        }
    }

    fn diamond_cfg() -> Cfg {
        // b0 -> b1 -> b3, b0 -> b2 -> b3
        let mut blocks = HashMap::new();
        for id in 0..4 {
            blocks.insert(BlockId(id), block(id, vec![]));
        }
        let edges = vec![
            Edge {
                from: BlockId(0),
                to: BlockId(1),
                kind: EdgeKind::True,
            },
            Edge {
                from: BlockId(0),
                to: BlockId(2),
                kind: EdgeKind::False,
            },
            Edge {
                from: BlockId(1),
                to: BlockId(3),
                kind: EdgeKind::Unconditional,
            },
            Edge {
                from: BlockId(2),
                to: BlockId(3),
                kind: EdgeKind::Unconditional,
            },
        ];
        Cfg::new(blocks, edges, BlockId(0), vec![BlockId(3)])
    }

    #[test]
    fn test_validate_ok() {
        assert!(diamond_cfg().validate().is_ok());
    }

    #[test]
    fn test_validate_bad_entry() {
        let mut cfg = diamond_cfg();
        cfg.entry = BlockId(99);
        assert!(matches!(cfg.validate(), Err(CfgError::InvalidEntry(_))));
    }

    #[test]
    fn test_validate_bad_edge() {
        let mut cfg = diamond_cfg();
        cfg.edges.push(Edge {
            from: BlockId(3),
            to: BlockId(42),
            kind: EdgeKind::Unconditional,
        });
        assert!(matches!(cfg.validate(), Err(CfgError::InvalidEdgeBlock(_))));
    }

    #[test]
    fn test_duplicate_block_rejected() {
        let mut cfg = diamond_cfg();
        let dup = block(0, vec![]);
        assert!(matches!(
            cfg.insert_block(dup),
            Err(CfgError::DuplicateBlockId(_))
        ));
    }

    #[test]
    fn test_adjacency() {
        let cfg = diamond_cfg();
        let mut succs = cfg.successors(BlockId(0)).to_vec();
        succs.sort_unstable();
        assert_eq!(succs, vec![BlockId(1), BlockId(2)]);
        let mut preds = cfg.predecessors(BlockId(3)).to_vec();
        preds.sort_unstable();
        assert_eq!(preds, vec![BlockId(1), BlockId(2)]);
    }

    #[test]
    fn test_topological_order_diamond() {
        let cfg = diamond_cfg();
        let order = cfg.topological_order();
        assert_eq!(order.len(), 4);
        let pos = |id: usize| order.iter().position(|&b| b == BlockId(id)).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(0) < pos(2));
        assert!(pos(1) < pos(3));
        assert!(pos(2) < pos(3));
    }

    #[test]
    fn test_back_edge_detection() {
        // b0 -> b1 -> b2, b1 -> b1 (self loop via back edge)
        let mut blocks = HashMap::new();
        for id in 0..3 {
            blocks.insert(BlockId(id), block(id, vec![]));
        }
        let edges = vec![
            Edge {
                from: BlockId(0),
                to: BlockId(1),
                kind: EdgeKind::Unconditional,
            },
            Edge {
                from: BlockId(1),
                to: BlockId(1),
                kind: EdgeKind::Back,
            },
            Edge {
                from: BlockId(1),
                to: BlockId(2),
                kind: EdgeKind::Unconditional,
            },
        ];
        let cfg = Cfg::new(blocks, edges, BlockId(0), vec![BlockId(2)]);
        let back = cfg.find_back_edges();
        assert!(back.contains(&(BlockId(1), BlockId(1))));
        // The loop must not break topological ordering.
        let order = cfg.topological_order();
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_resolve_name_walks_scope_chain() {
        let method_scope = ScopeId(0);
        let closure_scope = ScopeId(1);
        let method = Method {
            name: "m".to_string(),
            scopes: vec![
                Scope {
                    id: method_scope,
                    kind: ScopeKind::Method,
                    parent: None,
                },
                Scope {
                    id: closure_scope,
                    kind: ScopeKind::Closure(ClosureId(0)),
                    parent: Some(method_scope),
                },
            ],
            vars: vec![
                VarInfo {
                    name: "x".to_string(),
                    scope: method_scope,
                    mutable: true,
                },
                VarInfo {
                    name: "x".to_string(),
                    scope: closure_scope,
                    mutable: false,
                },
            ],
            closures: vec![],
            cfg: Cfg::new(
                {
                    let mut m = HashMap::new();
                    m.insert(
                        BlockId(0),
                        Block {
                            id: BlockId(0),
                            label: "entry".to_string(),
                            instrs: vec![],
                        },
                    );
                    m
                },
                vec![],
                BlockId(0),
                vec![BlockId(0)],
            ),
            method_scope,
        };

        // Shadowing: the closure-scope `x` wins from inside the closure.
        assert_eq!(method.resolve_name("x", closure_scope), Some(VarId(1)));
        // From the method scope only the outer `x` is visible.
        assert_eq!(method.resolve_name("x", method_scope), Some(VarId(0)));
        assert_eq!(method.resolve_name("y", closure_scope), None);
    }

    #[test]
    fn test_point_display() {
        let p = Point::new(GraphRef::Method, BlockId(2), 3);
        assert_eq!(p.to_string(), "b2:3");
        let q = Point::new(GraphRef::Closure(ClosureId(0)), BlockId(0), 1);
        assert_eq!(q.to_string(), "closure#0:b0:1");
    }
}
