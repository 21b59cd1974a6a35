//! SQLite checkpoint store.
//!
//! Implements `CheckpointStore` from `tollgate-core`. Each run owns a single
//! row keyed by its run id; the message history and the pending approval
//! request are stored as JSON text so a suspended run survives a restart.
//!
//! Writes compare `updated_at` against the version the writer started from,
//! so engines in different processes sharing one database cannot both
//! advance a run from the same checkpoint.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use uuid::Uuid;

use tollgate_core::repository::CheckpointStore;
use tollgate_types::approval::ApprovalRequest;
use tollgate_types::error::RepositoryError;
use tollgate_types::workflow::{Checkpoint, RunStatus, WorkflowState};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointStore`.
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct CheckpointRow {
    run_id: String,
    state: String,
    next_node: Option<String>,
    pending: Option<String>,
    resolved: Option<String>,
    status: String,
    steps: i64,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            state: row.try_get("state")?,
            next_node: row.try_get("next_node")?,
            pending: row.try_get("pending")?,
            resolved: row.try_get("resolved")?,
            status: row.try_get("status")?,
            steps: row.try_get("steps")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        let state: WorkflowState = serde_json::from_str(&self.state)
            .map_err(|e| RepositoryError::Query(format!("invalid state JSON: {e}")))?;

        let pending: Option<ApprovalRequest> = self
            .pending
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid pending JSON: {e}")))
            })
            .transpose()?;

        let resolved = self
            .resolved
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("invalid resolved id: {e}")))?;

        let status: RunStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let steps = u32::try_from(self.steps)
            .map_err(|_| RepositoryError::Query(format!("invalid step count: {}", self.steps)))?;

        Ok(Checkpoint {
            run_id: self.run_id,
            state,
            next_node: self.next_node,
            pending,
            resolved,
            status,
            steps,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width so `ORDER BY updated_at` sorts chronologically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_rows(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Checkpoint>, RepositoryError> {
    let mut checkpoints = Vec::with_capacity(rows.len());
    for row in rows {
        let r = CheckpointRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        checkpoints.push(r.into_checkpoint()?);
    }
    Ok(checkpoints)
}

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn put(
        &self,
        checkpoint: &Checkpoint,
        expected: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let state_json = serde_json::to_string(&checkpoint.state)
            .map_err(|e| RepositoryError::Query(format!("serialize state: {e}")))?;
        let pending_json = checkpoint
            .pending
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("serialize pending: {e}")))?;

        let resolved = checkpoint.resolved.map(|id| id.to_string());

        let result = match expected {
            None => {
                sqlx::query(
                    r#"INSERT INTO checkpoints
                       (run_id, state, next_node, pending, resolved, status, steps, error, created_at, updated_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                       ON CONFLICT(run_id) DO NOTHING"#,
                )
                .bind(&checkpoint.run_id)
                .bind(&state_json)
                .bind(&checkpoint.next_node)
                .bind(&pending_json)
                .bind(&resolved)
                .bind(checkpoint.status.to_string())
                .bind(i64::from(checkpoint.steps))
                .bind(&checkpoint.error)
                .bind(format_datetime(&checkpoint.created_at))
                .bind(format_datetime(&checkpoint.updated_at))
                .execute(&self.pool.writer)
                .await
            }
            Some(version) => {
                sqlx::query(
                    r#"UPDATE checkpoints SET
                         state = ?, next_node = ?, pending = ?, resolved = ?, status = ?,
                         steps = ?, error = ?, updated_at = ?
                       WHERE run_id = ? AND updated_at = ?"#,
                )
                .bind(&state_json)
                .bind(&checkpoint.next_node)
                .bind(&pending_json)
                .bind(&resolved)
                .bind(checkpoint.status.to_string())
                .bind(i64::from(checkpoint.steps))
                .bind(&checkpoint.error)
                .bind(format_datetime(&checkpoint.updated_at))
                .bind(&checkpoint.run_id)
                .bind(format_datetime(&version))
                .execute(&self.pool.writer)
                .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            tracing::debug!(run_id = %checkpoint.run_id, "checkpoint write lost a race");
            return Err(RepositoryError::Conflict(format!(
                "checkpoint for run '{}' changed concurrently",
                checkpoint.run_id
            )));
        }

        tracing::trace!(run_id = %checkpoint.run_id, status = %checkpoint.status, "checkpoint written");
        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, run_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, status: Option<RunStatus>) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM checkpoints WHERE status = ? ORDER BY updated_at DESC, run_id ASC",
                )
                .bind(s.to_string())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM checkpoints ORDER BY updated_at DESC, run_id ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_rows(&rows)
    }
}
