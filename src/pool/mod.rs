//! Bounded worker pools and their autoscalers.

mod autoscaler;
mod worker_pool;

pub use autoscaler::{start_autoscaling, Autoscaler, ScaleState};
pub use worker_pool::{PoolError, PoolStats, UnitResult, UnitStatus, WorkerPool};
