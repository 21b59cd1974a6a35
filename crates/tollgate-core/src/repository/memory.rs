//! In-memory checkpoint store backed by `DashMap`.
//!
//! Writes to the same run are serialized by the map's shard locks, and the
//! version check happens under that lock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use tollgate_types::error::RepositoryError;
use tollgate_types::workflow::{Checkpoint, RunStatus};

use super::checkpoint::CheckpointStore;

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<String, Checkpoint>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(
        &self,
        checkpoint: &Checkpoint,
        expected: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        match (self.checkpoints.entry(checkpoint.run_id.clone()), expected) {
            (Entry::Vacant(slot), None) => {
                slot.insert(checkpoint.clone());
                Ok(())
            }
            (Entry::Occupied(mut slot), Some(version)) if slot.get().updated_at == version => {
                slot.insert(checkpoint.clone());
                Ok(())
            }
            _ => Err(RepositoryError::Conflict(format!(
                "checkpoint for run '{}' changed concurrently",
                checkpoint.run_id
            ))),
        }
    }

    async fn get(&self, run_id: &str) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self.checkpoints.get(run_id).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, run_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.checkpoints.remove(run_id).is_some())
    }

    async fn list(&self, status: Option<RunStatus>) -> Result<Vec<Checkpoint>, RepositoryError> {
        let mut items: Vec<Checkpoint> = self
            .checkpoints
            .iter()
            .filter(|entry| status.is_none_or(|s| entry.status == s))
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(items)
    }
}
