//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Complexity, Effort, RootCause, Task, TaskStatus};

/// Insert a new task row for a repo issue. Returns the inserted task with
/// server-generated defaults (id, status = `new`, timestamps).
pub async fn insert_task(
    pool: &PgPool,
    repo: &str,
    issue_number: i32,
    max_attempts: i32,
    requested_harness: Option<&str>,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (repo, issue_number, status, max_attempts, requested_harness, \
                             dod, plan_steps, target_files, commands, \
                             attempt_count, loop_iterations, loop_replans, is_orchestrated) \
         VALUES ($1, $2, 'new', $3, $4, '{}', '{}', '{}', '[]'::jsonb, 0, 0, 0, false) \
         RETURNING *",
    )
    .bind(repo)
    .bind(issue_number)
    .bind(max_attempts)
    .bind(requested_harness)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a task by its natural key (repo + issue number).
pub async fn get_task_by_repo_issue(
    pool: &PgPool,
    repo: &str,
    issue_number: i32,
) -> Result<Option<Task>> {
    let task =
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE repo = $1 AND issue_number = $2")
            .bind(repo)
            .bind(issue_number)
            .fetch_optional(pool)
            .await
            .context("failed to fetch task by repo/issue")?;

    Ok(task)
}

/// List all tasks in a given status, oldest first.
pub async fn list_tasks_by_status(pool: &PgPool, status: TaskStatus) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = $1 ORDER BY created_at ASC",
    )
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list tasks by status")?;

    Ok(tasks)
}

/// List every non-terminal task (candidates for the scheduler tick).
pub async fn list_active_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status NOT IN ('completed', 'failed') ORDER BY updated_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list active tasks")?;

    Ok(tasks)
}

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row is only updated if the current status
/// still matches. Returns the number of rows affected (0 means the
/// expected `from` status no longer held, so the caller should reload and
/// retry or abort).
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = $1, updated_at = NOW() WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Record the planner's output: DoD items, ordered plan steps, target
/// files, optional multi-file plan blob, ordered commands, and the
/// complexity/effort estimate.
#[allow(clippy::too_many_arguments)]
pub async fn record_planning_output(
    pool: &PgPool,
    task_id: Uuid,
    dod: &[String],
    plan_steps: &[String],
    target_files: &[String],
    multi_file_plan: Option<&serde_json::Value>,
    commands: &serde_json::Value,
    complexity: Complexity,
    effort: Effort,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks \
         SET dod = $1, plan_steps = $2, target_files = $3, multi_file_plan = $4, \
             commands = $5, complexity = $6, effort = $7, updated_at = NOW() \
         WHERE id = $8",
    )
    .bind(dod)
    .bind(plan_steps)
    .bind(target_files)
    .bind(multi_file_plan)
    .bind(commands)
    .bind(complexity)
    .bind(effort)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to record planning output")?;

    Ok(())
}

/// Record the coder's output: branch name, diff, and commit message.
pub async fn record_coding_output(
    pool: &PgPool,
    task_id: Uuid,
    branch_name: &str,
    diff: &str,
    commit_message: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks \
         SET branch_name = $1, current_diff = $2, commit_message = $3, updated_at = NOW() \
         WHERE id = $4",
    )
    .bind(branch_name)
    .bind(diff)
    .bind(commit_message)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to record coding output")?;

    Ok(())
}

/// Record the opened pull request's identity.
pub async fn record_pr(
    pool: &PgPool,
    task_id: Uuid,
    pr_number: i32,
    pr_url: &str,
    pr_title: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET pr_number = $1, pr_url = $2, pr_title = $3, updated_at = NOW() \
         WHERE id = $4",
    )
    .bind(pr_number)
    .bind(pr_url)
    .bind(pr_title)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to record pr")?;

    Ok(())
}

/// Increment the attempt counter and record the last error and its root
/// cause, as the Fixing/Reflecting handlers do on a failed attempt.
pub async fn record_failure(
    pool: &PgPool,
    task_id: Uuid,
    last_error: &str,
    root_cause: Option<RootCause>,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks \
         SET attempt_count = attempt_count + 1, last_error = $1, root_cause = $2, \
             updated_at = NOW() \
         WHERE id = $3",
    )
    .bind(last_error)
    .bind(root_cause)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to record failure")?;

    Ok(())
}

/// Record one iteration of the agentic loop: bump `loop_iterations`, set the
/// last confidence score and cumulative duration, and optionally bump
/// `loop_replans` when the iteration triggered a replan.
pub async fn record_loop_iteration(
    pool: &PgPool,
    task_id: Uuid,
    confidence: f32,
    duration_ms: i64,
    replanned: bool,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks \
         SET loop_iterations = loop_iterations + 1, \
             loop_replans = loop_replans + CASE WHEN $1 THEN 1 ELSE 0 END, \
             last_confidence = $2, \
             loop_duration_ms = COALESCE(loop_duration_ms, 0) + $3, \
             updated_at = NOW() \
         WHERE id = $4",
    )
    .bind(replanned)
    .bind(confidence)
    .bind(duration_ms)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to record loop iteration")?;

    Ok(())
}

/// Record the local worktree path backing a task's branch, once created.
pub async fn set_worktree_path(pool: &PgPool, task_id: Uuid, worktree_path: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET worktree_path = $1, updated_at = NOW() WHERE id = $2")
        .bind(worktree_path)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set worktree path")?;

    Ok(())
}

/// Set (or clear, with `None`) the subtask currently in progress.
pub async fn set_current_subtask(
    pool: &PgPool,
    task_id: Uuid,
    subtask_id: Option<Uuid>,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET current_subtask_id = $1, updated_at = NOW() WHERE id = $2")
        .bind(subtask_id)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set current subtask")?;

    Ok(())
}

/// Mark a task as orchestrated (decomposed into subtasks) or not.
pub async fn set_is_orchestrated(pool: &PgPool, task_id: Uuid, is_orchestrated: bool) -> Result<()> {
    sqlx::query("UPDATE tasks SET is_orchestrated = $1, updated_at = NOW() WHERE id = $2")
        .bind(is_orchestrated)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set is_orchestrated")?;

    Ok(())
}

/// Reset an operator-approved retry: clear the last error, increment the
/// attempt count, and move the task back into `new` so the scheduler picks
/// it up from the top. Used by `operator_retry_task`.
pub async fn retry_task_from_waiting_human(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'new', attempt_count = attempt_count + 1, last_error = NULL, \
             updated_at = NOW() \
         WHERE id = $1 AND status IN ('waiting_human', 'failed')",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to retry task from waiting_human")?;

    Ok(result.rows_affected())
}

/// List tasks sitting in a non-terminal, non-waiting status whose
/// `updated_at` is older than `cutoff` (spec §6.4 stale-task sweep
/// candidates). The scheduler decides per task whether to retry or fail
/// based on `attempt_count` vs `max_attempts`.
pub async fn list_stale_candidates(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status NOT IN ('completed', 'failed', 'waiting_human', 'waiting_batch') \
           AND updated_at < $1 \
         ORDER BY updated_at ASC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list stale task candidates")?;

    Ok(tasks)
}

/// Retry a stale task: reset it to `new` with an incremented attempt count,
/// so the scheduler picks it back up from the top of the pipeline. Scoped
/// by the task's last-observed status to avoid racing a concurrent tick
/// that already moved it elsewhere.
pub async fn retry_stale_task(pool: &PgPool, task_id: Uuid, from: TaskStatus) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'new', attempt_count = attempt_count + 1, \
             last_error = 'stale: no progress before deadline, retrying', \
             updated_at = NOW() \
         WHERE id = $1 AND status = $2",
    )
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to retry stale task")?;

    Ok(result.rows_affected())
}
