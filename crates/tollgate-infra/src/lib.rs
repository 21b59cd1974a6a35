//! Infrastructure layer for Tollgate.
//!
//! Implements the checkpoint store port defined in `tollgate-core` on SQLite
//! and loads `config.toml` from the data directory.

pub mod config;
pub mod sqlite;
