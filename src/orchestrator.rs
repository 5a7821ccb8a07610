//! Orchestrator: task intake to terminal status.
//!
//! `create_task` validates the definition, persists the task, expands it
//! into subtasks, dedups and stores them, then fires off dispatch and
//! monitoring in the background and returns immediately. Cancellation and
//! deletion flip persisted flags that the background machinery observes
//! lazily.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::error::{ExpandError, ValidationError};
use crate::expander::expand_task;
use crate::matrix::{assemble, TaskMatrix};
use crate::model::subtask::Subtask;
use crate::model::task::{Task, TaskDefinition, TaskStatus};
use crate::monitor::TaskMonitor;
use crate::notify::{events, Notification, Notifier};
use crate::store::{StoreError, SubtaskStore, TaskStore};

/// Default pause between terminal-status polls in `wait_until_terminal`.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("expansion failed: {0}")]
    Expand(#[from] ExpandError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Wires intake, expansion, storage, dispatch, and monitoring together.
pub struct Orchestrator {
    tasks: Arc<dyn TaskStore>,
    subtasks: Arc<dyn SubtaskStore>,
    dispatcher: Arc<Dispatcher>,
    notifier: Arc<Notifier>,
    monitor_interval: Duration,
    retention_days: i64,
}

impl Orchestrator {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        subtasks: Arc<dyn SubtaskStore>,
        dispatcher: Arc<Dispatcher>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            tasks,
            subtasks,
            dispatcher,
            notifier,
            monitor_interval: Duration::from_secs(5),
            retention_days: 30,
        }
    }

    /// Overrides the monitor polling interval; used by embedders and tests.
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Overrides the retention window used by the sweep.
    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    /// Accepts a task: validate, persist, expand, dedup-insert subtasks,
    /// then dispatch and monitor in the background. Returns the task
    /// record as soon as the subtasks are stored.
    pub async fn create_task(
        &self,
        definition: TaskDefinition,
    ) -> Result<Task, OrchestratorError> {
        definition.validate()?;

        let task = Task::from_definition(definition);
        let task_id = task.id;
        self.tasks.insert_task(task.clone()).await?;
        info!(
            task_id = %task_id,
            name = %task.name,
            total_images = task.total_images,
            "task accepted"
        );

        let specs = match expand_task(&task) {
            Ok(specs) => specs,
            Err(err) => {
                error!(task_id = %task_id, error = %err, "expansion failed");
                self.tasks
                    .update_task_status(task_id, TaskStatus::Failed, Some(err.to_string()))
                    .await?;
                self.notifier.send(
                    Notification::new(
                        events::TASK_FAILED,
                        task_id.to_string(),
                        &task.name,
                        &task.owner,
                    )
                    .with_detail("error", err.to_string())
                    .with_detail("stage", "preparation")
                    .with_message("task failed during preparation"),
                );
                return Err(err.into());
            }
        };

        let records: Vec<Subtask> = specs
            .into_iter()
            .map(|spec| Subtask::from_spec(task_id, task.settings.api_queue, spec))
            .collect();
        let expanded = records.len();
        let created = self.subtasks.create_batch(records).await?;
        info!(
            task_id = %task_id,
            expanded,
            created = created.len(),
            existing = expanded - created.len(),
            "subtasks stored"
        );

        self.tasks
            .update_task_status(task_id, TaskStatus::Processing, None)
            .await?;
        self.notifier.send(
            Notification::new(
                events::TASK_SUBMITTED,
                task_id.to_string(),
                &task.name,
                &task.owner,
            )
            .with_detail("combinations", expanded)
            .with_detail("expected_images", task.total_images),
        );

        // Fire-and-forget: submission and monitoring both outlive this call.
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            dispatcher.submit_subtasks(task_id, &created).await;
        });
        self.spawn_monitor(task_id);

        Ok(self.tasks.get_task(task_id).await?)
    }

    /// Starts a background monitor for a task.
    pub fn spawn_monitor(&self, task_id: Uuid) -> JoinHandle<()> {
        let monitor = TaskMonitor::new(
            Arc::clone(&self.tasks),
            Arc::clone(&self.subtasks),
            Arc::clone(&self.notifier),
        )
        .with_interval(self.monitor_interval);

        tokio::spawn(async move {
            if let Err(err) = monitor.run(task_id).await {
                warn!(task_id = %task_id, error = %err, "task monitor aborted");
            }
        })
    }

    /// Flips the task to `cancelled`. Running subtasks are not killed; the
    /// monitor and dispatcher observe the flag on their next pass.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<(), OrchestratorError> {
        self.tasks
            .update_task_status(task_id, TaskStatus::Cancelled, None)
            .await?;
        info!(task_id = %task_id, "task cancelled");
        Ok(())
    }

    /// Soft-deletes a task; records disappear at the next retention sweep.
    pub async fn delete_task(&self, task_id: Uuid) -> Result<(), OrchestratorError> {
        self.tasks.mark_deleted(task_id).await?;
        Ok(())
    }

    /// Hard-removes tasks older than the retention window together with
    /// their subtasks. Returns the number of removed tasks.
    pub async fn sweep_expired(&self) -> Result<usize, OrchestratorError> {
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days);
        let removed = self.tasks.sweep_expired(cutoff).await?;
        for task_id in &removed {
            let dropped = self.subtasks.delete_subtasks_by_parent(*task_id).await?;
            info!(task_id = %task_id, subtasks = dropped, "expired task removed");
        }
        Ok(removed.len())
    }

    /// Builds the result matrix for a task.
    pub async fn matrix(&self, task_id: Uuid) -> Result<TaskMatrix, OrchestratorError> {
        let task = self.tasks.get_task(task_id).await?;
        let subtasks = self.subtasks.subtasks_by_parent(task_id).await?;
        Ok(assemble(&task, &subtasks))
    }

    /// Fetches the current task record.
    pub async fn get_task(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        Ok(self.tasks.get_task(task_id).await?)
    }

    /// Polls until the task reaches a terminal status and returns it.
    pub async fn wait_until_terminal(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        loop {
            let task = self.tasks.get_task(task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(self.monitor_interval)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{GenerateRequest, ImageApi, ImageApiError, ImageOutput};
    use crate::config::PollSettings;
    use crate::model::task::{Tag, TagType, TaskSettings, ValueRecord, Variable};
    use crate::pool::WorkerPool;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct AlwaysOk;

    #[async_trait]
    impl ImageApi for AlwaysOk {
        async fn generate(&self, request: &GenerateRequest) -> Result<ImageOutput, ImageApiError> {
            Ok(ImageOutput {
                url: format!("https://img/{}.png", request.seed),
                width: 1024,
                height: 1024,
                seed: request.seed,
            })
        }
    }

    fn orchestrator(store: &Arc<MemoryStore>) -> Orchestrator {
        let dispatcher = Dispatcher::new(
            WorkerPool::new("default", 4),
            WorkerPool::new("lumina", 2),
            Arc::clone(store) as Arc<dyn TaskStore>,
            Arc::clone(store) as Arc<dyn SubtaskStore>,
            Arc::new(AlwaysOk),
            RetryPolicy::default(),
            PollSettings::new(3, Duration::from_millis(5)),
            PollSettings::new(3, Duration::from_millis(5)),
        );
        Orchestrator::new(
            Arc::clone(store) as Arc<dyn TaskStore>,
            Arc::clone(store) as Arc<dyn SubtaskStore>,
            dispatcher,
            Notifier::disabled(),
        )
        .with_monitor_interval(Duration::from_millis(10))
    }

    fn grid_definition() -> TaskDefinition {
        let mut variables = BTreeMap::new();
        variables.insert(
            "v0".to_string(),
            Variable {
                name: "subject".to_string(),
                tag_id: "t1".to_string(),
                values: vec![
                    ValueRecord::plain("cat"),
                    ValueRecord::plain("dog"),
                ],
                values_count: 2,
            },
        );
        TaskDefinition {
            name: "orchestrated".to_string(),
            owner: "tester".to_string(),
            tags: vec![
                Tag {
                    id: "t1".to_string(),
                    tag_type: TagType::Prompt,
                    value: String::new(),
                    is_variable: true,
                    name: Some("subject".to_string()),
                    weight: None,
                    uuid: None,
                    header_img: None,
                },
                Tag {
                    id: "t2".to_string(),
                    tag_type: TagType::Seed,
                    value: "77".to_string(),
                    is_variable: false,
                    name: None,
                    weight: None,
                    uuid: None,
                    header_img: None,
                },
            ],
            variables,
            settings: TaskSettings::default(),
            priority: 1,
        }
    }

    #[tokio::test]
    async fn test_create_task_to_completion() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(&store);

        let task = orchestrator
            .create_task(grid_definition())
            .await
            .expect("task accepted");
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.total_images, 2);

        let finished = tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator.wait_until_terminal(task.id),
        )
        .await
        .expect("terminal before timeout")
        .expect("task resolves");
        assert_eq!(finished.status, TaskStatus::Completed);
        assert_eq!(finished.processed_images, 2);
        assert_eq!(finished.progress, 100);

        let matrix = orchestrator.matrix(task.id).await.expect("matrix builds");
        assert_eq!(matrix.coordinates_by_indices.len(), 2);
        assert!(matrix.coordinates_by_indices.contains_key("0,,,,,"));
        assert!(matrix.coordinates_by_indices.contains_key("1,,,,,"));
    }

    #[tokio::test]
    async fn test_validation_rejected_before_persist() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(&store);

        let mut definition = grid_definition();
        definition.owner = String::new();
        let err = orchestrator.create_task(definition).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(store.list_tasks().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_expansion_failure_fails_task() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(&store);

        let mut definition = grid_definition();
        definition.tags.push(Tag {
            id: "t3".to_string(),
            tag_type: TagType::Batch,
            value: "not-a-number".to_string(),
            is_variable: false,
            name: None,
            weight: None,
            uuid: None,
            header_img: None,
        });

        let err = orchestrator.create_task(definition).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Expand(_)));

        let tasks = store.list_tasks().await.expect("list");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert!(tasks[0].error.as_deref().unwrap_or("").contains("batch"));
    }

    #[tokio::test]
    async fn test_resubmission_dedups_subtasks() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(&store);

        let first = orchestrator
            .create_task(grid_definition())
            .await
            .expect("first accepted");
        tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator.wait_until_terminal(first.id),
        )
        .await
        .expect("terminal")
        .expect("resolves");

        // The same coordinates under the same parent are not re-created.
        let before = store
            .subtasks_by_parent(first.id)
            .await
            .expect("list")
            .len();
        let subtasks = store.subtasks_by_parent(first.id).await.expect("list");
        let dupes = store
            .create_batch(subtasks.clone())
            .await
            .expect("create batch");
        assert!(dupes.is_empty());
        assert_eq!(
            store.subtasks_by_parent(first.id).await.expect("list").len(),
            before
        );
    }

    #[tokio::test]
    async fn test_cancel_task() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(&store);

        let task = orchestrator
            .create_task(grid_definition())
            .await
            .expect("accepted");
        // Depending on timing the monitor may already have finished the
        // tiny grid; both outcomes are legal, only a terminal one is not
        // cancellable twice.
        match orchestrator.cancel_task(task.id).await {
            Ok(()) => {
                let task = orchestrator.get_task(task.id).await.expect("get");
                assert_eq!(task.status, TaskStatus::Cancelled);
            }
            Err(OrchestratorError::Store(StoreError::TerminalTransition { .. })) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_old_tasks() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(&store).with_retention_days(30);

        let task = orchestrator
            .create_task(grid_definition())
            .await
            .expect("accepted");
        tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator.wait_until_terminal(task.id),
        )
        .await
        .expect("terminal")
        .expect("resolves");

        // Fresh task: nothing to sweep.
        assert_eq!(orchestrator.sweep_expired().await.expect("sweep"), 0);

        // Backdate past the retention window and sweep again.
        {
            let mut old = store.get_task(task.id).await.expect("get");
            old.created_at = Utc::now() - chrono::Duration::days(31);
            store.insert_task(old).await.expect("re-insert");
        }
        assert_eq!(orchestrator.sweep_expired().await.expect("sweep"), 1);
        assert!(store.get_task(task.id).await.is_err());
        assert!(store
            .subtasks_by_parent(task.id)
            .await
            .expect("list")
            .is_empty());
    }
}
