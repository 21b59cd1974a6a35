//! Shared domain types for Tollgate.
//!
//! This crate contains the core domain types used across the workflow engine:
//! messages and tool calls, the human approval contract, workflow state and
//! checkpoints, lifecycle events, configuration, and their error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod approval;
pub mod config;
pub mod error;
pub mod event;
pub mod llm;
pub mod message;
pub mod tool;
pub mod workflow;
