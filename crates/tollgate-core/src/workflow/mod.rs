//! Workflow engine core: node contract, graph validation, durable checkpoints
//! and the suspendable run loop.
//!
//! - `node` -- `Node` trait, `NodeOutput` (update / command / suspend), node errors
//! - `graph` -- graph builder, edge table, routers, `petgraph` validation
//! - `checkpoint` -- checkpoint manager over a `CheckpointStore`
//! - `engine` -- run loop, start / resume / recover, per-run serialization

pub mod checkpoint;
pub mod engine;
pub mod graph;
pub mod node;

#[cfg(test)]
mod scenarios;

pub use checkpoint::CheckpointError;
pub use engine::{CheckpointMismatch, EngineError, EngineStats, RunOutcome, WorkflowEngine};
pub use graph::{CompiledGraph, END, GraphBuilder, GraphError};
pub use node::{Node, NodeContext, NodeError, NodeOutput, ResumeInput};
