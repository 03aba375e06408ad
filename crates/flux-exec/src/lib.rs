//! # flux-exec
//!
//! The typed surface of the engine: [`context::Context`] (C10), the DIA
//! node/graph and stage builder (C11, C12, in [`node`]), the LOp chain
//! ([`dia::Dia`]), and the surface operator set built on top of them
//! ([`operators`]) — Map/Filter/FlatMap/Collapse, ReduceByKey/ReducePair,
//! GroupByKey, Sort, Zip, PrefixSum, and the Size/Sum/AllReduce/AllGather/
//! ReadLines/WriteLines actions and sources.

pub mod context;
pub mod dia;
pub mod node;
pub mod operators;

pub use context::Context;
pub use dia::{DataSource, Dia};
pub use node::{build_stage, run_stage, ExecNode, NodeCore, NodeKind, NodeState};
