//! Two-pool dispatch: route subtasks, execute them, write outcomes back.
//!
//! A subtask belongs to the Lumina pool iff any of its prompts names a
//! Lumina entity (case-insensitive substring); everything else goes to the
//! default pool. Each submitted unit drives one subtask end to end: call
//! the image API, classify failures through the retry policy, and record
//! the terminal outcome in the store.
//!
//! Retries run inside the unit while it holds its pool slot. The upstream
//! design re-submitted retries through the pool, which lets in-flight work
//! grow without bound under load; keeping the slot bounds retries by
//! construction while preserving the same observable status flips and
//! retry counts.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::{GenerateRequest, ImageApi};
use crate::config::PollSettings;
use crate::metrics;
use crate::model::subtask::{GenerationResult, Subtask, SubtaskStatus};
use crate::model::task::TaskStatus;
use crate::pool::WorkerPool;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{SubtaskStore, TaskStore};

/// Interval between submission progress log lines, in units.
const SUBMIT_LOG_EVERY: usize = 10;

/// Routes subtasks to pools and builds their execution units.
pub struct Dispatcher {
    default_pool: Arc<WorkerPool>,
    lumina_pool: Arc<WorkerPool>,
    tasks: Arc<dyn TaskStore>,
    subtasks: Arc<dyn SubtaskStore>,
    client: Arc<dyn ImageApi>,
    policy: RetryPolicy,
    poll: PollSettings,
    lumina_poll: PollSettings,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        default_pool: Arc<WorkerPool>,
        lumina_pool: Arc<WorkerPool>,
        tasks: Arc<dyn TaskStore>,
        subtasks: Arc<dyn SubtaskStore>,
        client: Arc<dyn ImageApi>,
        policy: RetryPolicy,
        poll: PollSettings,
        lumina_poll: PollSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            default_pool,
            lumina_pool,
            tasks,
            subtasks,
            client,
            policy,
            poll,
            lumina_poll,
        })
    }

    /// Picks the pool and polling cadence for a subtask.
    pub fn route(&self, subtask: &Subtask) -> (&Arc<WorkerPool>, PollSettings) {
        if subtask.is_lumina() {
            (&self.lumina_pool, self.lumina_poll)
        } else {
            (&self.default_pool, self.poll)
        }
    }

    /// Submits a batch of freshly created subtasks to their pools,
    /// logging progress every few units.
    pub async fn submit_subtasks(&self, parent_task_id: Uuid, ids: &[Uuid]) {
        let total = ids.len();
        info!(parent_task_id = %parent_task_id, total, "submitting subtasks");

        for (index, id) in ids.iter().enumerate() {
            let subtask = match self.subtasks.get_subtask(*id).await {
                Ok(subtask) => subtask,
                Err(err) => {
                    warn!(subtask_id = %id, error = %err, "skipping unloadable subtask");
                    continue;
                }
            };

            let (pool, poll) = self.route(&subtask);
            let unit = execute_subtask(
                Arc::clone(&self.tasks),
                Arc::clone(&self.subtasks),
                Arc::clone(&self.client),
                self.policy,
                poll,
                pool.name().to_string(),
                *id,
            );
            pool.submit(*id, unit);

            if (index + 1) % SUBMIT_LOG_EVERY == 0 || index + 1 == total {
                info!(
                    parent_task_id = %parent_task_id,
                    submitted = index + 1,
                    total,
                    "subtask submission progress"
                );
            }
        }
    }

    /// Cancels a unit wherever it is queued or running.
    pub fn cancel_unit(&self, id: Uuid) -> bool {
        self.default_pool.cancel(id) || self.lumina_pool.cancel(id)
    }

    pub fn default_pool(&self) -> &Arc<WorkerPool> {
        &self.default_pool
    }

    pub fn lumina_pool(&self) -> &Arc<WorkerPool> {
        &self.lumina_pool
    }
}

/// Executes one subtask to a terminal state.
///
/// Every failed attempt advances `retry_count` by one; the retry policy
/// decides against the pre-increment count whether to re-attempt (holding
/// the pool slot) or to fail terminally. Terminal transitions advance the
/// parent's processed counter inside the store.
async fn execute_subtask(
    tasks: Arc<dyn TaskStore>,
    subtasks: Arc<dyn SubtaskStore>,
    client: Arc<dyn ImageApi>,
    policy: RetryPolicy,
    poll: PollSettings,
    pool_name: String,
    id: Uuid,
) -> Result<(), String> {
    let subtask = subtasks
        .get_subtask(id)
        .await
        .map_err(|err| err.to_string())?;

    // A cancelled parent stops producing results; already-running units
    // elsewhere are left alone.
    if let Ok(task) = tasks.get_task(subtask.parent_task_id).await {
        if task.status == TaskStatus::Cancelled {
            subtasks
                .update_subtask_status(id, SubtaskStatus::Cancelled, None, false)
                .await
                .map_err(|err| err.to_string())?;
            metrics::record_subtask("cancelled", &pool_name);
            info!(subtask_id = %id, "parent cancelled before execution");
            return Ok(());
        }
    }

    subtasks
        .update_subtask_status(id, SubtaskStatus::Processing, None, false)
        .await
        .map_err(|err| err.to_string())?;

    let request = GenerateRequest {
        prompts: subtask.prompts.clone(),
        ratio: subtask.ratio.clone(),
        seed: subtask.seed,
        use_polish: subtask.use_polish,
        client_args: subtask.client_args.clone(),
        queue: subtask.api_queue,
        poll,
    };
    let queue_label = subtask.api_queue.to_string();
    let mut retry_count = subtask.retry_count;

    loop {
        let started = Instant::now();
        match client.generate(&request).await {
            Ok(output) => {
                metrics::record_generation_latency(&queue_label, started.elapsed().as_secs_f64());
                let result = GenerationResult {
                    url: output.url,
                    width: output.width,
                    height: output.height,
                    seed: output.seed,
                    created_at: Utc::now(),
                };
                subtasks
                    .set_subtask_result(id, result)
                    .await
                    .map_err(|err| err.to_string())?;
                metrics::record_subtask("completed", &pool_name);
                info!(
                    subtask_id = %id,
                    attempts = retry_count + 1,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "subtask completed"
                );
                return Ok(());
            }
            Err(error) => {
                metrics::record_generation_latency(&queue_label, started.elapsed().as_secs_f64());
                let attempt = retry_count + 1;
                match policy.classify(&error, retry_count) {
                    RetryDecision::RetryNow => {
                        warn!(
                            subtask_id = %id,
                            attempt,
                            error = %error,
                            "attempt failed, retrying immediately"
                        );
                        subtasks
                            .update_subtask_status(
                                id,
                                SubtaskStatus::Processing,
                                Some(format!("attempt {} failed: {}", attempt, error)),
                                true,
                            )
                            .await
                            .map_err(|err| err.to_string())?;
                        retry_count += 1;
                    }
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            subtask_id = %id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "attempt failed, retrying after backoff"
                        );
                        subtasks
                            .update_subtask_status(
                                id,
                                SubtaskStatus::Processing,
                                Some(format!("attempt {} failed: {}", attempt, error)),
                                true,
                            )
                            .await
                            .map_err(|err| err.to_string())?;
                        retry_count += 1;
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::Fail => {
                        let message = format!("attempt {} failed terminally: {}", attempt, error);
                        warn!(subtask_id = %id, attempt, error = %error, "subtask failed");
                        subtasks
                            .update_subtask_status(
                                id,
                                SubtaskStatus::Failed,
                                Some(message.clone()),
                                true,
                            )
                            .await
                            .map_err(|err| err.to_string())?;
                        metrics::record_subtask("failed", &pool_name);
                        return Err(message);
                    }
                }
            }
        }
    }
}
