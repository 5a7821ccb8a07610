//! In-process store implementation backed by a single `RwLock`.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::model::coordinate::Coordinate;
use crate::model::subtask::{GenerationResult, Subtask, SubtaskStatus};
use crate::model::task::{Task, TaskStatus};

use super::{StoreError, SubtaskStore, TaskStore};

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    subtasks: HashMap<Uuid, Subtask>,
    parent_index: HashMap<Uuid, Vec<Uuid>>,
}

impl Inner {
    /// Advances the parent's processed counter after a terminal subtask.
    /// The counter is clamped to `total_images` and the percentage is
    /// recomputed in the same critical section, which is what makes the
    /// update atomic from the callers' point of view.
    fn bump_processed(&mut self, parent_task_id: Uuid) {
        if let Some(task) = self.tasks.get_mut(&parent_task_id) {
            task.processed_images = if task.total_images > 0 {
                (task.processed_images + 1).min(task.total_images)
            } else {
                task.processed_images + 1
            };
            task.progress = progress_percent(task.processed_images, task.total_images);
            task.updated_at = Utc::now();
        }
    }
}

fn progress_percent(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((processed * 100) / total).min(100) as u8
}

/// A store keeping all records in process memory.
///
/// All writes go through row-conditional updates under one writer lock;
/// reads clone records out so callers never hold the lock across awaits.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: Task) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.parent_index.entry(task.id).or_default();
        inner.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.tasks.values().cloned().collect())
    }

    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;

        if task.status.is_terminal() && task.status != status {
            return Err(StoreError::TerminalTransition {
                id,
                from: task.status.to_string(),
            });
        }

        task.status = status;
        if let Some(message) = error {
            task.error = Some(message);
        }
        task.updated_at = Utc::now();
        if status.is_terminal() && task.completed_at.is_none() {
            task.completed_at = Some(task.updated_at);
        }
        Ok(())
    }

    async fn finalize_progress(&self, id: Uuid, processed: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;

        task.processed_images = if task.total_images > 0 {
            processed.min(task.total_images)
        } else {
            processed
        };
        task.progress = progress_percent(task.processed_images, task.total_images);
        task.all_subtasks_completed = true;
        task.updated_at = Utc::now();
        if task.completed_at.is_none() {
            task.completed_at = Some(task.updated_at);
        }
        Ok(())
    }

    async fn mark_deleted(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        task.is_deleted = true;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.inner.write().await;
        let expired: Vec<Uuid> = inner
            .tasks
            .values()
            .filter(|task| task.created_at < cutoff)
            .map(|task| task.id)
            .collect();
        for id in &expired {
            inner.tasks.remove(id);
        }
        Ok(expired)
    }
}

#[async_trait]
impl SubtaskStore for MemoryStore {
    async fn create_batch(&self, subtasks: Vec<Subtask>) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.inner.write().await;
        let mut created = Vec::new();

        for subtask in subtasks {
            // Random-seed subtasks are intentionally duplicable.
            if subtask.seed != 0 {
                let occupied = inner
                    .parent_index
                    .get(&subtask.parent_task_id)
                    .map(|ids| {
                        ids.iter().any(|id| {
                            inner
                                .subtasks
                                .get(id)
                                .map(|existing| existing.coordinate == subtask.coordinate)
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false);
                if occupied {
                    debug!(
                        parent_task_id = %subtask.parent_task_id,
                        coordinate = %subtask.coordinate,
                        "skipping duplicate subtask"
                    );
                    continue;
                }
            }

            let id = subtask.id;
            inner
                .parent_index
                .entry(subtask.parent_task_id)
                .or_default()
                .push(id);
            inner.subtasks.insert(id, subtask);
            created.push(id);
        }

        Ok(created)
    }

    async fn get_subtask(&self, id: Uuid) -> Result<Subtask, StoreError> {
        let inner = self.inner.read().await;
        inner
            .subtasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::SubtaskNotFound(id))
    }

    async fn subtasks_by_parent(&self, parent_task_id: Uuid) -> Result<Vec<Subtask>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .parent_index
            .get(&parent_task_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.subtasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn existing_by_coordinates(
        &self,
        parent_task_id: Uuid,
        coordinates: &[Coordinate],
    ) -> Result<Vec<Subtask>, StoreError> {
        let wanted: HashSet<&Coordinate> = coordinates.iter().collect();
        let inner = self.inner.read().await;
        Ok(inner
            .parent_index
            .get(&parent_task_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.subtasks.get(id))
                    .filter(|subtask| wanted.contains(&subtask.coordinate))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_subtask_status(
        &self,
        id: Uuid,
        status: SubtaskStatus,
        error: Option<String>,
        increment_retry: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let subtask = inner
            .subtasks
            .get_mut(&id)
            .ok_or(StoreError::SubtaskNotFound(id))?;

        if subtask.status.is_terminal() {
            return Err(StoreError::TerminalTransition {
                id,
                from: subtask.status.to_string(),
            });
        }

        let now = Utc::now();
        subtask.status = status;
        subtask.updated_at = now;
        if let Some(message) = error {
            subtask.error = Some(message);
        }
        if increment_retry {
            subtask.retry_count += 1;
        }
        if status == SubtaskStatus::Processing && subtask.started_at.is_none() {
            subtask.started_at = Some(now);
        }

        if status.is_terminal() {
            subtask.completed_at = Some(now);
            let parent = subtask.parent_task_id;
            if status.counts_as_processed() {
                inner.bump_processed(parent);
            }
        }
        Ok(())
    }

    async fn set_subtask_result(
        &self,
        id: Uuid,
        result: GenerationResult,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let subtask = inner
            .subtasks
            .get_mut(&id)
            .ok_or(StoreError::SubtaskNotFound(id))?;

        if subtask.status.is_terminal() {
            return Err(StoreError::TerminalTransition {
                id,
                from: subtask.status.to_string(),
            });
        }

        let now = Utc::now();
        subtask.result = Some(result);
        subtask.status = SubtaskStatus::Completed;
        subtask.error = None;
        subtask.updated_at = now;
        subtask.completed_at = Some(now);

        let parent = subtask.parent_task_id;
        inner.bump_processed(parent);
        Ok(())
    }

    async fn delete_subtasks_by_parent(&self, parent_task_id: Uuid) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let ids = inner.parent_index.remove(&parent_task_id).unwrap_or_default();
        let removed = ids.len();
        for id in ids {
            inner.subtasks.remove(&id);
        }
        Ok(removed)
    }
}
