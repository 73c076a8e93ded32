//! Programmatic construction of method graphs.
//!
//! Fixtures are hand-built rather than parsed, so the builder keeps the
//! ergonomics of writing one close to the source program it mimics:
//!
//! ```
//! use lambdaflow::ir::builder::MethodBuilder;
//! use lambdaflow::ir::types::Operand;
//!
//! let mut m = MethodBuilder::new("KotlinAnonymousFunction.issue");
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
//! assert_eq!(method.closures.len(), 1);
//! ```
//!
//! Instructions append to the current block; `new_block`/`edge`/`switch_to`
//! give explicit control over branching and loops.

use std::collections::HashMap;

use super::types::{
    Block, BlockId, Cfg, CfgError, ClosureDef, ClosureId, Edge, EdgeKind, Instr, Method, Operand,
    Place, Scope, ScopeId, ScopeKind, VarId, VarInfo,
};

/// Builder for a single [`Method`] fixture.
#[derive(Debug)]
pub struct MethodBuilder {
    name: String,
    scopes: Vec<Scope>,
    vars: Vec<VarInfo>,
    closures: Vec<ClosureDef>,
    blocks: HashMap<BlockId, Block>,
    edges: Vec<Edge>,
    current: BlockId,
    next_block: usize,
    method_scope: ScopeId,
}

impl MethodBuilder {
    /// Start a new method. The entry block becomes the current block.
    pub fn new(name: impl Into<String>) -> Self {
        let method_scope = ScopeId(0);
        let entry = BlockId(0);
        let mut blocks = HashMap::new();
        blocks.insert(
            entry,
            Block {
                id: entry,
                label: "entry".to_string(),
                instrs: Vec::new(),
            },
        );
        Self {
            name: name.into(),
            scopes: vec![Scope {
                id: method_scope,
                kind: ScopeKind::Method,
                parent: None,
            }],
            vars: Vec::new(),
            closures: Vec::new(),
            blocks,
            edges: Vec::new(),
            current: entry,
            next_block: 1,
            method_scope,
        }
    }

    /// Declare an immutable local in the method scope.
    pub fn declare(&mut self, name: impl Into<String>) -> VarId {
        self.declare_in(name, self.method_scope, false)
    }

    /// Declare a mutable local in the method scope.
    pub fn declare_mut(&mut self, name: impl Into<String>) -> VarId {
        self.declare_in(name, self.method_scope, true)
    }

    fn declare_in(&mut self, name: impl Into<String>, scope: ScopeId, mutable: bool) -> VarId {
        let id = VarId(self.vars.len());
        self.vars.push(VarInfo {
            name: name.into(),
            scope,
            mutable,
        });
        id
    }

    fn push(&mut self, instr: Instr) {
        self.blocks
            .get_mut(&self.current)
            .expect("current block exists")
            .instrs
            .push(instr);
    }

    /// `target = value`.
    pub fn assign(&mut self, target: VarId, value: Operand) {
        self.push(Instr::Assign {
            target: Place::Var(target),
            value,
        });
    }

    /// `target = <untainted constant>`.
    pub fn assign_const(&mut self, target: VarId) {
        self.assign(target, Operand::Const);
    }

    /// `target = <source call>()` introducing taint of `kind`.
    pub fn source(&mut self, target: VarId, kind: impl Into<String>) {
        self.push(Instr::Source {
            target: Place::Var(target),
            kind: kind.into(),
        });
    }

    /// `callee(arg)` where `callee` is classified as a sink of `kind`.
    pub fn sink(&mut self, callee: impl Into<String>, kind: impl Into<String>, arg: Operand) {
        self.push(Instr::Sink {
            callee: callee.into(),
            kind: kind.into(),
            arg,
        });
    }

    /// Define a closure at method level and build its body with `build`.
    pub fn closure<F>(&mut self, build: F) -> ClosureId
    where
        F: FnOnce(&mut ClosureBuilder<'_>),
    {
        let id = ClosureId(self.closures.len());
        let scope = ScopeId(self.scopes.len());
        self.scopes.push(Scope {
            id: scope,
            kind: ScopeKind::Closure(id),
            parent: Some(self.method_scope),
        });

        let entry = BlockId(0);
        let mut blocks = HashMap::new();
        blocks.insert(
            entry,
            Block {
                id: entry,
                label: "entry".to_string(),
                instrs: Vec::new(),
            },
        );
        let mut builder = ClosureBuilder {
            outer: self,
            scope,
            blocks,
            edges: Vec::new(),
            current: entry,
            next_block: 1,
        };
        build(&mut builder);

        let ClosureBuilder {
            blocks, edges, ..
        } = builder;
        let exits = exit_blocks(&blocks, &edges);
        self.closures.push(ClosureDef {
            id,
            scope,
            cfg: Cfg::new(blocks, edges, entry, exits),
        });
        id
    }

    /// `target = <closure literal>`.
    pub fn create_closure(&mut self, target: VarId, closure: ClosureId) {
        self.push(Instr::CreateClosure { target, closure });
    }

    /// `closure_var()` discarding the result.
    pub fn invoke(&mut self, closure: VarId) {
        self.push(Instr::Invoke {
            result: None,
            closure,
        });
    }

    /// `result = closure_var()`.
    pub fn invoke_into(&mut self, result: VarId, closure: VarId) {
        self.push(Instr::Invoke {
            result: Some(result),
            closure,
        });
    }

    /// The closure value held by `closure` leaves the method.
    pub fn escape(&mut self, closure: VarId) {
        self.push(Instr::Escape { closure });
    }

    /// `return value`.
    pub fn ret(&mut self, value: Option<Operand>) {
        self.push(Instr::Return { value });
    }

    /// Create a new empty block (no implicit edge from the current block).
    pub fn new_block(&mut self, label: impl Into<String>) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        self.blocks.insert(
            id,
            Block {
                id,
                label: label.into(),
                instrs: Vec::new(),
            },
        );
        id
    }

    /// Add an edge between two blocks.
    pub fn edge(&mut self, from: BlockId, to: BlockId, kind: EdgeKind) {
        self.edges.push(Edge { from, to, kind });
    }

    /// Make `block` the target of subsequent instruction pushes.
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    /// The block instructions are currently appended to.
    pub fn current_block(&self) -> BlockId {
        self.current
    }

    /// Finalize the method. Blocks with no outgoing edges become exits.
    ///
    /// # Errors
    ///
    /// Returns [`CfgError`] if the body CFG or any closure body CFG fails
    /// structural validation.
    pub fn finish(self) -> Result<Method, CfgError> {
        let exits = exit_blocks(&self.blocks, &self.edges);
        let method = Method {
            name: self.name,
            scopes: self.scopes,
            vars: self.vars,
            closures: self.closures,
            cfg: Cfg::new(self.blocks, self.edges, BlockId(0), exits),
            method_scope: self.method_scope,
        };
        method.validate()?;
        Ok(method)
    }
}

/// Builder for one closure body, with access to the enclosing variable arena.
#[derive(Debug)]
pub struct ClosureBuilder<'a> {
    outer: &'a mut MethodBuilder,
    scope: ScopeId,
    blocks: HashMap<BlockId, Block>,
    edges: Vec<Edge>,
    current: BlockId,
    next_block: usize,
}

impl ClosureBuilder<'_> {
    /// Declare a local in the closure's own scope.
    pub fn declare(&mut self, name: impl Into<String>) -> VarId {
        self.outer.declare_in(name, self.scope, false)
    }

    /// Declare a mutable local in the closure's own scope.
    pub fn declare_mut(&mut self, name: impl Into<String>) -> VarId {
        self.outer.declare_in(name, self.scope, true)
    }

    fn push(&mut self, instr: Instr) {
        self.blocks
            .get_mut(&self.current)
            .expect("current block exists")
            .instrs
            .push(instr);
    }

    /// `local = value`.
    pub fn assign(&mut self, target: VarId, value: Operand) {
        self.push(Instr::Assign {
            target: Place::Var(target),
            value,
        });
    }

    /// Write an enclosing-scope name: `outer_name = value`.
    pub fn assign_free(&mut self, name: impl Into<String>, value: Operand) {
        self.push(Instr::Assign {
            target: Place::Free(name.into()),
            value,
        });
    }

    /// `local = <source call>()`.
    pub fn source(&mut self, target: VarId, kind: impl Into<String>) {
        self.push(Instr::Source {
            target: Place::Var(target),
            kind: kind.into(),
        });
    }

    /// `outer_name = <source call>()`.
    pub fn source_free(&mut self, name: impl Into<String>, kind: impl Into<String>) {
        self.push(Instr::Source {
            target: Place::Free(name.into()),
            kind: kind.into(),
        });
    }

    /// Read an enclosing-scope name as an operand.
    pub fn free(&self, name: impl Into<String>) -> Operand {
        Operand::Free(name.into())
    }

    /// `callee(arg)` where `callee` is classified as a sink of `kind`.
    pub fn sink(&mut self, callee: impl Into<String>, kind: impl Into<String>, arg: Operand) {
        self.push(Instr::Sink {
            callee: callee.into(),
            kind: kind.into(),
            arg,
        });
    }

    /// `return value` from the closure body.
    pub fn ret(&mut self, value: Option<Operand>) {
        self.push(Instr::Return { value });
    }

    /// Create a new empty block in the closure body.
    pub fn new_block(&mut self, label: impl Into<String>) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        self.blocks.insert(
            id,
            Block {
                id,
                label: label.into(),
                instrs: Vec::new(),
            },
        );
        id
    }

    /// Add an edge between two closure-body blocks.
    pub fn edge(&mut self, from: BlockId, to: BlockId, kind: EdgeKind) {
        self.edges.push(Edge { from, to, kind });
    }

    /// Make `block` the target of subsequent instruction pushes.
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }
}

/// Blocks without outgoing edges, in ID order.
fn exit_blocks(blocks: &HashMap<BlockId, Block>, edges: &[Edge]) -> Vec<BlockId> {
    let mut exits: Vec<BlockId> = blocks
        .keys()
        .filter(|id| !edges.iter().any(|e| e.from == **id))
        .copied()
        .collect();
    exits.sort_unstable();
    exits
}
