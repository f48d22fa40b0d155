//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with semantic names used by the orchestrator and the
//! operator-facing CLI overrides (spec §7, SPEC_FULL.md "Supplemented
//! features").

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

use orc_db::models::{RootCause, TaskStatus};
use orc_db::queries::tasks as db;

use crate::error::CoreErrorCode;
use crate::events;

use super::TaskStateMachine;

/// Non-recoverable failure path (spec §7): set `status = Failed`, record the
/// error and root cause, emit a `Failed` event, and (best-effort) leave an
/// avoidance-strategy note for the memory subsystem to pick up.
///
/// Called by any handler that exhausts `max_attempts` or hits a
/// non-recoverable error code.
pub async fn fail_task(
    pool: &PgPool,
    task_id: Uuid,
    code: CoreErrorCode,
    message: &str,
) -> Result<()> {
    error!(%task_id, code = %code, %message, "task failed non-recoverably");

    let current = db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    if current.status.is_terminal() {
        return Ok(());
    }

    db::record_failure(pool, task_id, message, Some(root_cause_for(code))).await?;

    // Transition is best-effort from whatever state the task is actually
    // in; every non-terminal state has a `-> Failed` edge (spec §4.1).
    TaskStateMachine::transition(pool, task_id, current.status, TaskStatus::Failed).await?;

    events::record(
        pool,
        task_id,
        events::EventType::Failed,
        None,
        None,
        Some(&format!("{code}: {message}")),
    )
    .await;

    Ok(())
}

fn root_cause_for(code: CoreErrorCode) -> RootCause {
    use CoreErrorCode::*;
    match code {
        InvalidDiff | SyntaxError | TypecheckFailed | DiffTooLarge => RootCause::Code,
        ComplexityTooHigh | MissingField | InvalidState => RootCause::Plan,
        SubtaskFailed | MaxAttemptsReached | AgenticLoopExhausted => RootCause::Code,
        CommandFailed | Timeout => RootCause::Environment,
        UnknownError => RootCause::Environment,
    }
}

/// Operator override: approve a task stuck in `plan_pending_approval`,
/// letting it proceed to `planning_done` as if planning had completed
/// without requiring approval.
pub async fn approve_plan(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::PlanPendingApproval,
        TaskStatus::PlanningDone,
    )
    .await
}

/// Operator override: approve a task awaiting manual review sign-off,
/// moving `reviewing -> review_approved` directly.
pub async fn approve_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Reviewing,
        TaskStatus::ReviewApproved,
    )
    .await
}

/// Operator override: reject a task under review, sending it back through
/// `review_rejected -> coding` on the next tick.
pub async fn reject_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Reviewing,
        TaskStatus::ReviewRejected,
    )
    .await
}

/// Operator override: manually retry a task parked in `waiting_human` (or
/// already `failed`), resetting it to `new` so the scheduler re-admits it.
/// Increments `attempt_count` so repeated manual retries still converge on
/// `max_attempts`.
pub async fn operator_retry_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    let rows = db::retry_task_from_waiting_human(pool, task_id).await?;
    if rows == 0 {
        anyhow::bail!(
            "cannot retry task {task_id}: not in waiting_human or failed status"
        );
    }
    Ok(())
}
