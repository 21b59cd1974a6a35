//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (tollgate-infra) implements. An in-memory implementation lives here for
//! tests and single-process use.

pub mod checkpoint;
pub mod memory;

pub use checkpoint::CheckpointStore;
pub use memory::InMemoryCheckpointStore;
