//! Workflow engine and port definitions for Tollgate.
//!
//! This crate defines the "ports" (provider and checkpoint store traits) that
//! the infrastructure layer implements, the graph engine that runs a
//! suspendable workflow, and the reasoning / approval / execution nodes. It
//! depends only on `tollgate-types` -- never on `tollgate-infra` or any
//! database/IO crate.

pub mod agent;
pub mod event;
pub mod llm;
pub mod repository;
pub mod tool;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
