//! Method-level intermediate representation.
//!
//! A [`Method`] is a control-flow graph of taint-relevant instructions plus
//! the closure bodies defined inside it, each with its own CFG and a scope
//! chained under the method scope. Fixtures construct methods through
//! [`builder::MethodBuilder`].

pub mod builder;
pub mod types;

pub use builder::{ClosureBuilder, MethodBuilder};
pub use types::{
    Block, BlockId, Cfg, CfgError, ClosureDef, ClosureId, Edge, EdgeKind, GraphRef, Instr, Method,
    Operand, Place, Point, Scope, ScopeId, ScopeKind, VarId, VarInfo,
};
