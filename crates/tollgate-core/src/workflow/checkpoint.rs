//! Durable checkpoint manager for run state.
//!
//! Wraps a `CheckpointStore` with the writes the engine performs: a running
//! checkpoint after every completed node, a suspension (state + node to
//! re-enter + pending request), a completion and a failure. A cancelled or
//! timed-out node leaves the last of those exactly as it was.
//!
//! Every write is conditional on the version the writer last saw, carried
//! in [`Lineage`].

use chrono::{DateTime, Utc};
use uuid::Uuid;

use tollgate_types::approval::ApprovalRequest;
use tollgate_types::error::RepositoryError;
use tollgate_types::workflow::{Checkpoint, RunStatus, WorkflowState};

use crate::repository::checkpoint::CheckpointStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages the single live checkpoint of each run.
///
/// Generic over `S: CheckpointStore` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<S: CheckpointStore> {
    store: S,
}

/// Bookkeeping carried from the previous checkpoint into the next one.
#[derive(Debug, Clone, Copy)]
pub struct Lineage {
    pub created_at: DateTime<Utc>,
    pub prior_steps: u32,
    /// `updated_at` of the checkpoint this invocation started from, advanced
    /// on every write. `None` for a run with nothing stored yet.
    pub version: Option<DateTime<Utc>>,
}

impl Lineage {
    pub fn fresh() -> Self {
        Self {
            created_at: Utc::now(),
            prior_steps: 0,
            version: None,
        }
    }

    pub fn of(checkpoint: &Checkpoint) -> Self {
        Self {
            created_at: checkpoint.created_at,
            prior_steps: checkpoint.steps,
            version: Some(checkpoint.updated_at),
        }
    }

    /// Timestamp for the next write; strictly after the current version.
    fn next_version(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.version {
            Some(previous) if now <= previous => previous + chrono::Duration::nanoseconds(1),
            _ => now,
        }
    }

    fn checkpoint(&self, run_id: &str, state: &WorkflowState, steps: u32) -> Checkpoint {
        Checkpoint {
            run_id: run_id.to_string(),
            state: state.clone(),
            next_node: None,
            pending: None,
            resolved: None,
            status: RunStatus::Running,
            steps: self.prior_steps + steps,
            error: None,
            created_at: self.created_at,
            updated_at: self.next_version(),
        }
    }
}

impl<S: CheckpointStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        self.store
            .get(run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Persist progress between nodes. `next` is where an interrupted run
    /// picks up; `resolved` is the request whose decision is being carried out.
    pub async fn save_running(
        &self,
        run_id: &str,
        state: &WorkflowState,
        next: &str,
        resolved: Option<Uuid>,
        lineage: &mut Lineage,
        steps: u32,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint {
            next_node: Some(next.to_string()),
            resolved,
            ..lineage.checkpoint(run_id, state, steps)
        };
        self.write(&checkpoint, lineage).await?;

        tracing::trace!(run_id, next, "checkpointed progress");
        Ok(checkpoint)
    }

    /// Persist a suspension. `node` is re-entered with the human's response.
    pub async fn save_suspended(
        &self,
        run_id: &str,
        state: &WorkflowState,
        node: &str,
        request: &ApprovalRequest,
        lineage: &mut Lineage,
        steps: u32,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint {
            next_node: Some(node.to_string()),
            pending: Some(request.clone()),
            status: RunStatus::Suspended,
            ..lineage.checkpoint(run_id, state, steps)
        };
        self.write(&checkpoint, lineage).await?;

        tracing::debug!(
            run_id,
            node,
            request_id = %request.id,
            "checkpointed suspension"
        );
        Ok(checkpoint)
    }

    /// Persist a run that reached the terminal.
    pub async fn save_completed(
        &self,
        run_id: &str,
        state: &WorkflowState,
        lineage: &mut Lineage,
        steps: u32,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint {
            status: RunStatus::Completed,
            ..lineage.checkpoint(run_id, state, steps)
        };
        self.write(&checkpoint, lineage).await?;

        tracing::debug!(run_id, messages = state.len(), "checkpointed completion");
        Ok(checkpoint)
    }

    /// Persist a run aborted by a fatal error. The state is the last one
    /// that applied cleanly.
    pub async fn save_failed(
        &self,
        run_id: &str,
        state: &WorkflowState,
        lineage: &mut Lineage,
        steps: u32,
        error: &str,
    ) -> Result<(), CheckpointError> {
        let checkpoint = Checkpoint {
            status: RunStatus::Failed,
            error: Some(error.to_string()),
            ..lineage.checkpoint(run_id, state, steps)
        };
        self.write(&checkpoint, lineage).await?;

        tracing::debug!(run_id, error, "checkpointed failure");
        Ok(())
    }

    async fn write(
        &self,
        checkpoint: &Checkpoint,
        lineage: &mut Lineage,
    ) -> Result<(), CheckpointError> {
        match self.store.put(checkpoint, lineage.version).await {
            Ok(()) => {
                lineage.version = Some(checkpoint.updated_at);
                Ok(())
            }
            Err(RepositoryError::Conflict(_)) => {
                tracing::warn!(
                    run_id = %checkpoint.run_id,
                    "checkpoint changed underneath this invocation"
                );
                Err(CheckpointError::Conflict {
                    run_id: checkpoint.run_id.clone(),
                })
            }
            Err(e) => Err(CheckpointError::Repository(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint store error: {0}")]
    Repository(String),

    /// Another invocation advanced the run first.
    #[error("run '{run_id}' was advanced by another invocation")]
    Conflict { run_id: String },
}
