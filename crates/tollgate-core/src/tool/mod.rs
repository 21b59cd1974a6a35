//! Tool provider abstractions for Tollgate.
//!
//! - `ToolProvider`: RPITIT trait for capability discovery and invocation
//! - `BoxToolProvider`: Object-safe wrapper for dynamic dispatch
//! - `ToolRegistry`: connect-time discovery, hidden helpers, reference lists
//!   and prompt context

pub mod box_provider;
pub mod provider;
pub mod registry;

pub use box_provider::BoxToolProvider;
pub use provider::ToolProvider;
pub use registry::{RegistryError, ToolRegistry};
