//! Task monitor: aggregates subtask completion into task-terminal status.
//!
//! One monitor runs per active task. Every tick it re-reads the task and
//! its subtasks; once every subtask is terminal it decides the task's
//! final status, writes the final progress snapshot, emits a lifecycle
//! notification, and exits. A cancelled task ends monitoring immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use crate::metrics;
use crate::model::subtask::SubtaskStatus;
use crate::model::task::TaskStatus;
use crate::notify::{events, Notification, Notifier};
use crate::store::{StoreError, SubtaskStore, TaskStore};

/// Default pause between aggregate reads.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// How a monitored task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Every subtask completed.
    Completed,
    /// Some subtasks completed, some failed; the task still counts as
    /// completed.
    PartialCompleted,
    /// Every subtask failed.
    Failed,
    /// The task was cancelled while monitoring.
    Cancelled,
}

/// Aggregated subtask counts for one pass.
#[derive(Debug, Default, Clone, Copy)]
struct StatusCounts {
    total: usize,
    completed: usize,
    failed: usize,
    processing: usize,
    pending: usize,
}

/// Watches one task until it reaches a terminal state.
pub struct TaskMonitor {
    tasks: Arc<dyn TaskStore>,
    subtasks: Arc<dyn SubtaskStore>,
    notifier: Arc<Notifier>,
    interval: Duration,
}

impl TaskMonitor {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        subtasks: Arc<dyn SubtaskStore>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            tasks,
            subtasks,
            notifier,
            interval: MONITOR_INTERVAL,
        }
    }

    /// Overrides the polling interval; used by embedders and tests.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs until the task reaches a terminal state.
    pub async fn run(&self, task_id: Uuid) -> Result<MonitorOutcome, StoreError> {
        let started = Instant::now();
        debug!(task_id = %task_id, "task monitor started");

        loop {
            tokio::time::sleep(self.interval).await;

            let task = self.tasks.get_task(task_id).await?;
            if task.status == TaskStatus::Cancelled {
                info!(task_id = %task_id, "task cancelled, monitor exiting");
                metrics::record_task("cancelled");
                return Ok(MonitorOutcome::Cancelled);
            }

            let subtasks = self.subtasks.subtasks_by_parent(task_id).await?;
            let counts = tally(&subtasks);
            if counts.total == 0 {
                // Expansion results are not visible yet.
                continue;
            }

            debug!(
                task_id = %task_id,
                total = counts.total,
                completed = counts.completed,
                failed = counts.failed,
                processing = counts.processing,
                pending = counts.pending,
                "monitor pass"
            );

            if counts.completed + counts.failed < counts.total {
                continue;
            }

            let elapsed_secs = started.elapsed().as_secs_f64();
            return self.finish(task_id, &task.name, &task.owner, counts, elapsed_secs).await;
        }
    }

    /// Writes the terminal status, finalizes progress, and notifies.
    async fn finish(
        &self,
        task_id: Uuid,
        task_name: &str,
        owner: &str,
        counts: StatusCounts,
        elapsed_secs: f64,
    ) -> Result<MonitorOutcome, StoreError> {
        let (status, outcome) = if counts.failed == counts.total {
            (TaskStatus::Failed, MonitorOutcome::Failed)
        } else if counts.failed > 0 {
            (TaskStatus::Completed, MonitorOutcome::PartialCompleted)
        } else {
            (TaskStatus::Completed, MonitorOutcome::Completed)
        };

        match self.tasks.update_task_status(task_id, status, None).await {
            Ok(()) => {}
            Err(StoreError::TerminalTransition { .. }) => {
                // Lost the race against a cancellation.
                let task = self.tasks.get_task(task_id).await?;
                if task.status == TaskStatus::Cancelled {
                    metrics::record_task("cancelled");
                    return Ok(MonitorOutcome::Cancelled);
                }
            }
            Err(err) => return Err(err),
        }

        self.tasks
            .finalize_progress(task_id, counts.total as u64)
            .await?;

        let task_id_text = task_id.to_string();
        let notification = match outcome {
            MonitorOutcome::Failed => {
                Notification::new(events::TASK_FAILED, &task_id_text, task_name, owner)
                    .with_detail("failed", format!("{}/{}", counts.failed, counts.total))
                    .with_detail("elapsed_secs", elapsed_secs)
                    .with_message("every subtask failed")
            }
            MonitorOutcome::PartialCompleted => {
                Notification::new(events::TASK_PARTIAL_COMPLETED, &task_id_text, task_name, owner)
                    .with_detail("completed", format!("{}/{}", counts.completed, counts.total))
                    .with_detail("failed", format!("{}/{}", counts.failed, counts.total))
                    .with_detail("elapsed_secs", elapsed_secs)
                    .with_message("task finished with failed subtasks")
            }
            _ => Notification::new(events::TASK_COMPLETED, &task_id_text, task_name, owner)
                .with_detail("completed", format!("{}/{}", counts.completed, counts.total))
                .with_detail("images", counts.completed)
                .with_detail("elapsed_secs", elapsed_secs),
        };
        self.notifier.send(notification);
        metrics::record_task(&status.to_string());

        info!(
            task_id = %task_id,
            status = %status,
            completed = counts.completed,
            failed = counts.failed,
            elapsed_secs,
            "task reached terminal state"
        );
        Ok(outcome)
    }
}

fn tally(subtasks: &[crate::model::subtask::Subtask]) -> StatusCounts {
    let mut counts = StatusCounts {
        total: subtasks.len(),
        ..Default::default()
    };
    for subtask in subtasks {
        match subtask.status {
            SubtaskStatus::Completed => counts.completed += 1,
            SubtaskStatus::Failed => counts.failed += 1,
            SubtaskStatus::Processing => counts.processing += 1,
            _ => counts.pending += 1,
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::coordinate::Coordinate;
    use crate::model::subtask::{ApiQueue, GenerationResult, PromptItem, Subtask, SubtaskSpec};
    use crate::model::task::{Task, TaskDefinition, TaskSettings};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::collections::BTreeMap;

    async fn seeded(subtask_count: usize) -> (Arc<MemoryStore>, Uuid, Vec<Uuid>) {
        let store = Arc::new(MemoryStore::new());
        let mut task = Task::from_definition(TaskDefinition {
            name: "monitor-test".to_string(),
            owner: "tester".to_string(),
            tags: Vec::new(),
            variables: BTreeMap::new(),
            settings: TaskSettings::default(),
            priority: 1,
        });
        task.total_images = subtask_count as u64;
        let task_id = task.id;
        store.insert_task(task).await.expect("insert task");

        let mut ids = Vec::new();
        for index in 0..subtask_count {
            let mut coordinate = Coordinate::empty();
            coordinate.set(0, index as u32);
            let subtask = Subtask::from_spec(
                task_id,
                ApiQueue::Prod,
                SubtaskSpec {
                    coordinate,
                    prompts: vec![PromptItem::freetext("x", 1.0)],
                    ratio: "1:1".to_string(),
                    seed: (index + 1) as i64,
                    use_polish: false,
                    client_args: Default::default(),
                    variable_types_map: BTreeMap::new(),
                    type_to_variable: BTreeMap::new(),
                },
            );
            ids.push(subtask.id);
            store.create_batch(vec![subtask]).await.expect("create");
        }
        (store, task_id, ids)
    }

    fn monitor(store: &Arc<MemoryStore>) -> TaskMonitor {
        TaskMonitor::new(
            Arc::clone(store) as Arc<dyn TaskStore>,
            Arc::clone(store) as Arc<dyn SubtaskStore>,
            Notifier::disabled(),
        )
        .with_interval(Duration::from_millis(10))
    }

    fn result(seed: i64) -> GenerationResult {
        GenerationResult {
            url: format!("https://img/{}.png", seed),
            width: 1024,
            height: 1024,
            seed,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_all_completed() {
        let (store, task_id, ids) = seeded(2).await;
        for (index, id) in ids.iter().enumerate() {
            store
                .set_subtask_result(*id, result(index as i64))
                .await
                .expect("set result");
        }

        let outcome = monitor(&store).run(task_id).await.expect("monitor runs");
        assert_eq!(outcome, MonitorOutcome::Completed);

        let task = store.get_task(task_id).await.expect("get task");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.processed_images, 2);
        assert!(task.all_subtasks_completed);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_partial_completion() {
        let (store, task_id, ids) = seeded(4).await;
        for id in &ids[..3] {
            store.set_subtask_result(*id, result(1)).await.expect("set result");
        }
        store
            .update_subtask_status(ids[3], SubtaskStatus::Failed, Some("boom".to_string()), true)
            .await
            .expect("fail subtask");

        let outcome = monitor(&store).run(task_id).await.expect("monitor runs");
        assert_eq!(outcome, MonitorOutcome::PartialCompleted);

        let task = store.get_task(task_id).await.expect("get task");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
    }

    #[tokio::test]
    async fn test_all_failed() {
        let (store, task_id, ids) = seeded(2).await;
        for id in &ids {
            store
                .update_subtask_status(*id, SubtaskStatus::Failed, Some("boom".to_string()), true)
                .await
                .expect("fail subtask");
        }

        let outcome = monitor(&store).run(task_id).await.expect("monitor runs");
        assert_eq!(outcome, MonitorOutcome::Failed);

        let task = store.get_task(task_id).await.expect("get task");
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_task_exits_early() {
        let (store, task_id, _ids) = seeded(2).await;
        store
            .update_task_status(task_id, TaskStatus::Cancelled, None)
            .await
            .expect("cancel");

        let outcome = monitor(&store).run(task_id).await.expect("monitor runs");
        assert_eq!(outcome, MonitorOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_waits_for_stragglers() {
        let (store, task_id, ids) = seeded(2).await;
        store.set_subtask_result(ids[0], result(1)).await.expect("set result");

        let monitor = monitor(&store);
        let run = monitor.run(task_id);
        let straggler = {
            let store = Arc::clone(&store);
            let id = ids[1];
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                store.set_subtask_result(id, result(2)).await.expect("set result");
            }
        };

        let (outcome, ()) = tokio::join!(run, straggler);
        assert_eq!(outcome.expect("monitor runs"), MonitorOutcome::Completed);
    }
}
