//! Task and subtask persistence behind trait seams.
//!
//! Durable storage is an external concern; the crate ships an in-process
//! implementation (`MemoryStore`) that enforces the invariants every
//! backend must honour:
//!
//! - a subtask never transitions out of a terminal state
//! - `retry_count` is monotonically non-decreasing
//! - the parent's `processed_images` advances exactly once per terminal
//!   subtask (completed or failed) and never exceeds `total_images`
//! - creation dedups on `(parent_task_id, coordinate)` unless `seed == 0`

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::coordinate::Coordinate;
use crate::model::subtask::{GenerationResult, Subtask, SubtaskStatus};
use crate::model::task::{Task, TaskStatus};

pub use memory::MemoryStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("subtask {0} not found")]
    SubtaskNotFound(Uuid),

    /// An attempt to move a record out of a terminal state.
    #[error("record {id} is already terminal ({from})")]
    TerminalTransition { id: Uuid, from: String },
}

/// Persistence surface for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: Task) -> Result<(), StoreError>;

    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError>;

    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Transitions a task's status, optionally recording an error string.
    /// Terminal tasks reject further transitions.
    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Writes the final progress snapshot: `processed_images`, the derived
    /// percentage, `all_subtasks_completed`, and `completed_at`.
    async fn finalize_progress(&self, id: Uuid, processed: u64) -> Result<(), StoreError>;

    /// Soft-deletes a task; subtasks are only removed by the sweep.
    async fn mark_deleted(&self, id: Uuid) -> Result<(), StoreError>;

    /// Hard-removes tasks created before `cutoff`, returning their ids so
    /// the caller can drop the matching subtasks.
    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;
}

/// Persistence surface for subtask records.
///
/// Terminal transitions advance the parent task's processed counter inside
/// the store, so executors only ever report their own outcome.
#[async_trait]
pub trait SubtaskStore: Send + Sync {
    /// Bulk-inserts subtasks, skipping `(parent, coordinate)` conflicts for
    /// deterministic seeds. Returns the ids actually created.
    async fn create_batch(&self, subtasks: Vec<Subtask>) -> Result<Vec<Uuid>, StoreError>;

    async fn get_subtask(&self, id: Uuid) -> Result<Subtask, StoreError>;

    async fn subtasks_by_parent(&self, parent_task_id: Uuid) -> Result<Vec<Subtask>, StoreError>;

    /// Batch lookup by coordinate, used to avoid re-creating subtasks on
    /// re-dispatch.
    async fn existing_by_coordinates(
        &self,
        parent_task_id: Uuid,
        coordinates: &[Coordinate],
    ) -> Result<Vec<Subtask>, StoreError>;

    /// Transitions a subtask's status. Stamps `started_at` on the first
    /// move to `processing` and `completed_at` on any terminal move; bumps
    /// `retry_count` when asked.
    async fn update_subtask_status(
        &self,
        id: Uuid,
        status: SubtaskStatus,
        error: Option<String>,
        increment_retry: bool,
    ) -> Result<(), StoreError>;

    /// Writes a result and transitions to `completed`.
    async fn set_subtask_result(
        &self,
        id: Uuid,
        result: GenerationResult,
    ) -> Result<(), StoreError>;

    async fn delete_subtasks_by_parent(&self, parent_task_id: Uuid) -> Result<usize, StoreError>;
}
