//! Bounded concurrent executor for async units.
//!
//! Each pool admits submitted units through a counting semaphore whose
//! size is adjustable at runtime. Growing the limit releases slots
//! immediately; shrinking drains — slots disappear as in-flight units
//! finish, and running work is never interrupted. Admission order is
//! whatever the semaphore wakes first; only the concurrency cap is
//! guaranteed.
//!
//! # Stats
//!
//! - `running`: units submitted and not yet finished (includes units still
//!   waiting for a slot; this is the autoscaler's backlog signal)
//! - `active`: units currently holding a slot, bounded by `limit`
//! - `completed`: units finished in any status
//! - `available_slots`: free permits right now

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Errors surfaced by pool lookups.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The unit id is neither running nor in the result cache.
    #[error("unit {0} is not tracked by this pool")]
    UnitNotFound(Uuid),

    /// Waiting for a unit's result exceeded the caller's deadline.
    #[error("timed out waiting for unit {0}")]
    WaitTimeout(Uuid),
}

/// Final status of a finished unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
            UnitStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Cached outcome of a finished unit.
#[derive(Debug, Clone)]
pub struct UnitResult {
    pub id: Uuid,
    pub status: UnitStatus,
    pub error: Option<String>,
    pub elapsed: Duration,
    pub completed_at: DateTime<Utc>,
}

impl UnitResult {
    fn completed(id: Uuid, elapsed: Duration) -> Self {
        Self {
            id,
            status: UnitStatus::Completed,
            error: None,
            elapsed,
            completed_at: Utc::now(),
        }
    }

    fn failed(id: Uuid, error: String, elapsed: Duration) -> Self {
        Self {
            id,
            status: UnitStatus::Failed,
            error: Some(error),
            elapsed,
            completed_at: Utc::now(),
        }
    }

    fn cancelled(id: Uuid) -> Self {
        Self {
            id,
            status: UnitStatus::Cancelled,
            error: Some("unit cancelled".to_string()),
            elapsed: Duration::ZERO,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UnitStatus::Completed
    }
}

/// Snapshot of a pool's counters.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub name: String,
    pub running: usize,
    pub active: usize,
    pub completed: usize,
    pub limit: usize,
    pub available_slots: usize,
}

/// Locks a mutex, recovering the inner value if a unit panicked while
/// holding it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A single-process pool of concurrently executing async units.
pub struct WorkerPool {
    name: String,
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    /// Permits still owed after a shrink; consumed as units finish.
    shrink_deficit: AtomicUsize,
    running: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicUsize,
    handles: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    results: Mutex<HashMap<Uuid, UnitResult>>,
    done: Notify,
}

impl WorkerPool {
    /// Creates a pool with the given concurrency limit.
    pub fn new(name: impl Into<String>, limit: usize) -> Arc<Self> {
        let limit = limit.max(1);
        Arc::new(Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(limit)),
            limit: AtomicUsize::new(limit),
            shrink_deficit: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            handles: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            done: Notify::new(),
        })
    }

    /// Returns the pool's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submits a unit. It starts executing once a slot is acquired; its
    /// outcome lands in the result cache under `id`.
    pub fn submit<F>(self: &Arc<Self>, id: Uuid, unit: F)
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.running.fetch_add(1, Ordering::SeqCst);

        // The guard is created before the spawn and owned by the future,
        // so bookkeeping runs even if the task is aborted before its first
        // poll.
        let mut guard = UnitGuard::new(Arc::clone(self), id);
        let handle = tokio::spawn(async move {
            let semaphore = Arc::clone(&guard.pool.semaphore);
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                // Closed semaphores only happen at shutdown; the guard
                // records the unit as cancelled.
                Err(_) => return,
            };
            guard.admit(permit);

            let started = Instant::now();
            let outcome = unit.await;
            guard.finish(outcome, started.elapsed());
        });

        lock(&self.handles).insert(id, handle);
        // A unit that finished before its handle landed cleans up here.
        if lock(&self.results).contains_key(&id) {
            lock(&self.handles).remove(&id);
        }
        debug!(
            pool = %self.name,
            unit_id = %id,
            running = self.running.load(Ordering::SeqCst),
            "unit submitted"
        );
    }

    /// Adjusts the concurrency limit.
    ///
    /// Raising the limit frees slots immediately (after cancelling any
    /// outstanding shrink). Lowering it forgets free permits now and books
    /// the remainder as a deficit paid off as units finish; in-flight
    /// units keep running.
    pub fn set_limit(&self, new_limit: usize) {
        let new_limit = new_limit.max(1);
        let old_limit = self.limit.swap(new_limit, Ordering::SeqCst);
        if new_limit == old_limit {
            return;
        }

        if new_limit > old_limit {
            let mut grow = new_limit - old_limit;
            loop {
                let deficit = self.shrink_deficit.load(Ordering::SeqCst);
                if deficit == 0 || grow == 0 {
                    break;
                }
                let take = deficit.min(grow);
                if self
                    .shrink_deficit
                    .compare_exchange(deficit, deficit - take, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    grow -= take;
                }
            }
            if grow > 0 {
                self.semaphore.add_permits(grow);
            }
        } else {
            let shrink = old_limit - new_limit;
            let forgotten = self.semaphore.forget_permits(shrink);
            if forgotten < shrink {
                self.shrink_deficit
                    .fetch_add(shrink - forgotten, Ordering::SeqCst);
            }
        }

        info!(
            pool = %self.name,
            old_limit,
            new_limit,
            "pool limit adjusted"
        );
    }

    /// Returns a permit to the pool, or burns it against a pending shrink.
    fn release_permit(&self, permit: OwnedSemaphorePermit) {
        let mut deficit = self.shrink_deficit.load(Ordering::SeqCst);
        while deficit > 0 {
            match self.shrink_deficit.compare_exchange(
                deficit,
                deficit - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    permit.forget();
                    return;
                }
                Err(actual) => deficit = actual,
            }
        }
        drop(permit);
    }

    /// Cancels a unit. A unit still waiting for a slot is removed before
    /// admission; an in-flight unit is interrupted at its next suspension
    /// point. Returns false when the unit already finished or was never
    /// submitted.
    pub fn cancel(&self, id: Uuid) -> bool {
        let handle = lock(&self.handles).remove(&id);
        match handle {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Returns a finished unit's cached result, if present.
    pub fn get_result(&self, id: Uuid) -> Option<UnitResult> {
        lock(&self.results).get(&id).cloned()
    }

    /// Waits for a unit's result, optionally bounded by `timeout`.
    pub async fn wait_result(
        &self,
        id: Uuid,
        timeout: Option<Duration>,
    ) -> Result<UnitResult, PoolError> {
        // Check the handle map before the result cache so a unit finishing
        // in between is still found.
        if !lock(&self.handles).contains_key(&id) && self.get_result(id).is_none() {
            return Err(PoolError::UnitNotFound(id));
        }

        let wait = async {
            loop {
                let notified = self.done.notified();
                if let Some(result) = self.get_result(id) {
                    return result;
                }
                notified.await;
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| PoolError::WaitTimeout(id)),
            None => Ok(wait.await),
        }
    }

    /// Returns a snapshot of the pool's counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            running: self.running.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            limit: self.limit.load(Ordering::SeqCst),
            available_slots: self.semaphore.available_permits(),
        }
    }
}

/// Per-unit bookkeeping that survives cancellation: dropped on every exit
/// path, including abort, so the counters and result cache stay accurate.
struct UnitGuard {
    pool: Arc<WorkerPool>,
    id: Uuid,
    permit: Option<OwnedSemaphorePermit>,
    outcome: Option<(Result<(), String>, Duration)>,
}

impl UnitGuard {
    fn new(pool: Arc<WorkerPool>, id: Uuid) -> Self {
        Self {
            pool,
            id,
            permit: None,
            outcome: None,
        }
    }

    fn admit(&mut self, permit: OwnedSemaphorePermit) {
        self.pool.active.fetch_add(1, Ordering::SeqCst);
        self.permit = Some(permit);
    }

    fn finish(&mut self, outcome: Result<(), String>, elapsed: Duration) {
        self.outcome = Some((outcome, elapsed));
    }
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.pool.active.fetch_sub(1, Ordering::SeqCst);
            self.pool.release_permit(permit);
        }
        self.pool.running.fetch_sub(1, Ordering::SeqCst);
        self.pool.completed.fetch_add(1, Ordering::SeqCst);

        let result = match self.outcome.take() {
            Some((Ok(()), elapsed)) => UnitResult::completed(self.id, elapsed),
            Some((Err(error), elapsed)) => UnitResult::failed(self.id, error, elapsed),
            None => UnitResult::cancelled(self.id),
        };
        lock(&self.pool.results).insert(self.id, result);
        lock(&self.pool.handles).remove(&self.id);
        self.pool.done.notify_waiters();
    }
}
