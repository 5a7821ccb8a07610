//! Per-pool autoscaling: backlog-driven scale-up, idle-driven scale-down.
//!
//! One autoscaler watches one pool. Every tick it reads the pool's stats
//! and may adjust the limit within the configured envelope:
//!
//! - scale up when the submitted backlog reaches twice the current limit
//! - scale down when fewer than half the slots are in use
//!
//! The Lumina variant additionally requires the pool to have been
//! completely empty for a grace period before any scale-down, because the
//! Lumina backend degrades badly when capacity flaps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PoolEnvelope;
use crate::metrics;

use super::worker_pool::{PoolStats, WorkerPool};

/// How often the autoscaler re-reads pool stats.
const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// How long the Lumina pool must sit empty before scale-down is allowed.
const LUMINA_EMPTY_GRACE: Duration = Duration::from_secs(180);

/// Mutable state carried between ticks.
#[derive(Debug, Default)]
pub struct ScaleState {
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
    empty_since: Option<Instant>,
}

/// Governs one pool's concurrency limit.
pub struct Autoscaler {
    pool: Arc<WorkerPool>,
    envelope: PoolEnvelope,
    /// When set, scale-down additionally requires a sustained-empty pool.
    require_empty_for_scale_down: bool,
}

impl Autoscaler {
    /// Creates an autoscaler with the default pool's scale-down behaviour.
    pub fn new(pool: Arc<WorkerPool>, envelope: PoolEnvelope) -> Self {
        Self {
            pool,
            envelope,
            require_empty_for_scale_down: false,
        }
    }

    /// Creates an autoscaler with the Lumina pool's conservative
    /// scale-down gate.
    pub fn new_lumina(pool: Arc<WorkerPool>, envelope: PoolEnvelope) -> Self {
        Self {
            pool,
            envelope,
            require_empty_for_scale_down: true,
        }
    }

    /// Decides the next limit for the observed stats, updating tick state.
    /// Returns `None` when no adjustment is due.
    pub fn next_limit(&self, state: &mut ScaleState, stats: &PoolStats, now: Instant) -> Option<usize> {
        let envelope = &self.envelope;

        // Scale up: backlog at twice the limit, envelope headroom, spacing.
        if stats.running >= stats.limit * 2 && stats.limit < envelope.max {
            let spaced = state
                .last_scale_up
                .map(|at| now.duration_since(at) >= envelope.scale_up_interval)
                .unwrap_or(true);
            if spaced {
                state.last_scale_up = Some(now);
                return Some((stats.limit + envelope.step).min(envelope.max));
            }
            return None;
        }

        // Scale down: fewer than half the slots in use, floor, spacing.
        if stats.running < stats.limit / 2 && stats.limit > envelope.min {
            if self.require_empty_for_scale_down {
                if stats.running > 0 {
                    if state.empty_since.take().is_some() {
                        debug!(pool = %stats.name, "pool busy again, resetting empty timer");
                    }
                    return None;
                }
                match state.empty_since {
                    None => {
                        state.empty_since = Some(now);
                        return None;
                    }
                    Some(since) if now.duration_since(since) < LUMINA_EMPTY_GRACE => {
                        return None;
                    }
                    Some(_) => {}
                }
            }

            let spaced = state
                .last_scale_down
                .map(|at| now.duration_since(at) >= envelope.scale_down_interval)
                .unwrap_or(true);
            if spaced {
                state.last_scale_down = Some(now);
                state.empty_since = None;
                return Some(stats.limit.saturating_sub(envelope.step).max(envelope.min));
            }
            return None;
        }

        // Busy pools reset the Lumina empty timer even when no scale-down
        // is otherwise possible.
        if self.require_empty_for_scale_down && stats.running > 0 {
            state.empty_since = None;
        }
        None
    }

    /// Spawns the background loop. The limit is raised to the envelope
    /// floor before the first tick.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut state = ScaleState::default();

            let stats = self.pool.stats();
            if stats.limit < self.envelope.min {
                info!(
                    pool = %stats.name,
                    limit = self.envelope.min,
                    "raising pool limit to envelope floor"
                );
                self.pool.set_limit(self.envelope.min);
            }

            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let stats = self.pool.stats();
                metrics::observe_pool(&stats);

                match self.next_limit(&mut state, &stats, Instant::now()) {
                    Some(new_limit) if new_limit != stats.limit => {
                        if new_limit > stats.limit {
                            info!(
                                pool = %stats.name,
                                running = stats.running,
                                old_limit = stats.limit,
                                new_limit,
                                "scaling up"
                            );
                        } else {
                            info!(
                                pool = %stats.name,
                                running = stats.running,
                                old_limit = stats.limit,
                                new_limit,
                                "scaling down"
                            );
                        }
                        self.pool.set_limit(new_limit);
                    }
                    Some(_) | None => {}
                }
            }
        })
    }
}

/// Convenience: spawns both pool autoscalers and logs their envelopes.
pub fn start_autoscaling(
    default_pool: Arc<WorkerPool>,
    default_envelope: PoolEnvelope,
    lumina_pool: Arc<WorkerPool>,
    lumina_envelope: PoolEnvelope,
) -> Vec<JoinHandle<()>> {
    if default_envelope.min > default_envelope.max || lumina_envelope.min > lumina_envelope.max {
        warn!("autoscaler envelope has min above max, scaling will clamp");
    }
    vec![
        Autoscaler::new(default_pool, default_envelope).spawn(),
        Autoscaler::new_lumina(lumina_pool, lumina_envelope).spawn(),
    ]
}
