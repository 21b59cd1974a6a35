//! Checkpoint store trait definition.
//!
//! One live checkpoint per run, keyed by the run (thread) id. `put` is a
//! compare-and-swap on the stored `updated_at`, so two processes sharing a
//! store cannot both advance the same run from the same checkpoint.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tollgate_types::error::RepositoryError;
use tollgate_types::workflow::{Checkpoint, RunStatus};

/// Storage for run checkpoints.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    /// Write the checkpoint for `checkpoint.run_id`.
    ///
    /// `expected` is the `updated_at` of the checkpoint the writer started
    /// from, or `None` when it started from nothing. A stored row that does
    /// not match fails with [`RepositoryError::Conflict`] and is left as is.
    fn put(
        &self,
        checkpoint: &Checkpoint,
        expected: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load the checkpoint for a run.
    fn get(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// Delete a run's checkpoint. Returns `true` if it existed.
    fn delete(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// List checkpoints, optionally filtered by status, most recently updated first.
    fn list(
        &self,
        status: Option<RunStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;
}

impl<S: CheckpointStore> CheckpointStore for Arc<S> {
    fn put(
        &self,
        checkpoint: &Checkpoint,
        expected: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        (**self).put(checkpoint, expected)
    }

    fn get(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send {
        (**self).get(run_id)
    }

    fn delete(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send {
        (**self).delete(run_id)
    }

    fn list(
        &self,
        status: Option<RunStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send {
        (**self).list(status)
    }
}
