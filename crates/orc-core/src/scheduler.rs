//! The scheduler (spec §4.11, §5, §6.4): the process-wide driver that ticks
//! every active task through the orchestrator, enforces per-task mutual
//! exclusion so a single task is never advanced by two ticks at once, and
//! periodically sweeps tasks that have gone quiet for longer than the
//! configured staleness window.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use orc_db::models::TaskStatus;
use orc_db::queries::tasks as task_db;

use crate::config::OrcConfig;
use crate::error::CoreErrorCode;
use crate::orchestrator::Orchestrator;
use crate::state::dispatch;

/// Tracks which task ids are currently being advanced by some in-flight
/// tick, so the scheduler never runs two ticks of the same task
/// concurrently (spec §5 per-task mutual exclusion).
#[derive(Debug, Clone, Default)]
pub struct InFlightGuardSet {
    inner: Arc<Mutex<HashSet<Uuid>>>,
}

impl InFlightGuardSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to acquire the lock for `task_id`. Returns `None` if another
    /// tick already holds it (the caller should simply skip this task this
    /// round); otherwise returns a guard that releases the lock on drop.
    pub fn try_acquire(&self, task_id: Uuid) -> Option<InFlightGuard> {
        let mut set = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(task_id) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.inner),
            task_id,
        })
    }

    pub fn is_in_flight(&self, task_id: Uuid) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&task_id)
    }
}

/// RAII handle releasing a task's in-flight slot when dropped, so a panic
/// or early return inside a tick never leaves the task permanently stuck.
pub struct InFlightGuard {
    set: Arc<Mutex<HashSet<Uuid>>>,
    task_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.task_id);
    }
}

/// Summary of one scheduler tick, returned for logging/testing.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub considered: usize,
    pub advanced: usize,
    pub skipped_in_flight: usize,
    pub errored: usize,
    pub swept_stale: usize,
}

/// Drives the task set forward: one call to [`TaskScheduler::tick`]
/// considers every active (non-terminal) task once, skipping any already
/// in flight, advancing each via the orchestrator, and running the stale
/// sweep (spec §6.4) before returning.
pub struct TaskScheduler {
    pool: PgPool,
    orchestrator: Orchestrator,
    config: Arc<OrcConfig>,
    in_flight: InFlightGuardSet,
}

impl TaskScheduler {
    pub fn new(pool: PgPool, orchestrator: Orchestrator, config: Arc<OrcConfig>) -> Self {
        Self {
            pool,
            orchestrator,
            config,
            in_flight: InFlightGuardSet::new(),
        }
    }

    pub fn in_flight_set(&self) -> InFlightGuardSet {
        self.in_flight.clone()
    }

    /// Advance every active task once, then sweep stale tasks.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        let active = task_db::list_active_tasks(&self.pool).await?;
        report.considered = active.len();

        for task in active {
            let task_id = task.id;
            let Some(guard) = self.in_flight.try_acquire(task_id) else {
                report.skipped_in_flight += 1;
                continue;
            };

            match self.orchestrator.process(task_id).await {
                Ok(()) => report.advanced += 1,
                Err(err) => {
                    report.errored += 1;
                    tracing::error!(task_id = %task_id, error = %err, "tick failed for task");
                    let _ = dispatch::fail_task(
                        &self.pool,
                        task_id,
                        CoreErrorCode::UnknownError,
                        &err.to_string(),
                    )
                    .await;
                }
            }

            drop(guard);
        }

        report.swept_stale = self.sweep_stale().await?;

        Ok(report)
    }

    /// Run [`Self::tick`] in a loop until either `max_ticks` ticks have run
    /// or `max_duration` has elapsed, whichever comes first (spec §4.11
    /// "bounded-step/bounded-duration advancement loop"). Intended for the
    /// CLI's one-shot `run` command; a long-lived server drives `tick`
    /// itself on a timer instead.
    pub async fn run_bounded(
        &self,
        max_ticks: usize,
        max_duration: Duration,
        tick_interval: Duration,
    ) -> Result<TickReport> {
        let start = std::time::Instant::now();
        let mut total = TickReport::default();

        for _ in 0..max_ticks {
            if start.elapsed() >= max_duration {
                break;
            }
            let report = self.tick().await?;
            total.considered += report.considered;
            total.advanced += report.advanced;
            total.skipped_in_flight += report.skipped_in_flight;
            total.errored += report.errored;
            total.swept_stale += report.swept_stale;

            if report.advanced == 0 && report.skipped_in_flight == 0 {
                // Nothing moved and nothing is pending elsewhere; no point
                // spinning the remaining ticks.
                break;
            }

            tokio::time::sleep(tick_interval).await;
        }

        Ok(total)
    }

    /// Stale-task sweep (spec §6.4): tasks that have sat in a non-terminal,
    /// non-waiting status past `stale_task_hours` either get retried (status
    /// reset to `New` with `attempt_count` bumped, if budget remains) or
    /// failed outright once `max_attempts` is exhausted.
    async fn sweep_stale(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.stale_task_hours);
        let candidates = task_db::list_stale_candidates(&self.pool, cutoff).await?;
        let mut swept = 0usize;

        for task in candidates {
            if self.in_flight.is_in_flight(task.id) {
                // Currently being advanced by a live tick; not actually
                // stuck, just mid-flight. Leave it alone.
                continue;
            }

            if task.attempt_count < task.max_attempts {
                let rows = task_db::retry_stale_task(&self.pool, task.id, task.status).await?;
                if rows > 0 {
                    swept += 1;
                    tracing::warn!(
                        task_id = %task.id,
                        from_status = ?task.status,
                        attempt = task.attempt_count + 1,
                        "stale task retried from New"
                    );
                }
            } else {
                dispatch::fail_task(
                    &self.pool,
                    task.id,
                    CoreErrorCode::MaxAttemptsReached,
                    &format!(
                        "stale in {:?} past the {}h staleness window with no attempts remaining",
                        task.status, self.config.stale_task_hours
                    ),
                )
                .await?;
                swept += 1;
            }
        }

        Ok(swept)
    }
}
