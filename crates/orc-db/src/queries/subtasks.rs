//! Database query functions for the `subtasks` table (spec §3, §4.8).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Subtask, SubtaskStatus};

/// Parameters for inserting one subtask produced by decomposition.
#[derive(Debug, Clone)]
pub struct NewSubtask {
    pub parent_task_id: Uuid,
    pub target_files: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub depends_on: Vec<Uuid>,
    pub seq: i32,
}

/// Insert a new subtask row, `pending` by default.
pub async fn insert_subtask(pool: &PgPool, new: &NewSubtask) -> Result<Subtask> {
    let subtask = sqlx::query_as::<_, Subtask>(
        "INSERT INTO subtasks \
            (parent_task_id, status, target_files, acceptance_criteria, depends_on, seq) \
         VALUES ($1, 'pending', $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(new.parent_task_id)
    .bind(&new.target_files)
    .bind(&new.acceptance_criteria)
    .bind(&new.depends_on)
    .bind(new.seq)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert subtask for parent {}", new.parent_task_id))?;

    Ok(subtask)
}

/// List every subtask belonging to a parent task, in `seq` order (the
/// topological `execution_order` computed at decomposition time).
pub async fn list_subtasks(pool: &PgPool, parent_task_id: Uuid) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks WHERE parent_task_id = $1 ORDER BY seq ASC",
    )
    .bind(parent_task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list subtasks for parent {parent_task_id}"))?;

    Ok(subtasks)
}

/// Fetch a single subtask by id.
pub async fn get_subtask(pool: &PgPool, id: Uuid) -> Result<Option<Subtask>> {
    let subtask = sqlx::query_as::<_, Subtask>("SELECT * FROM subtasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch subtask")?;

    Ok(subtask)
}

/// Patch a subtask's status and, optionally, its diff and child task id.
/// Always increments `attempt_count` when moving into `failed` so the
/// `MAX_SUBTASK_ATTEMPTS` budget in §4.8 can be enforced by the caller.
pub async fn update_subtask_status(
    pool: &PgPool,
    subtask_id: Uuid,
    status: SubtaskStatus,
    diff: Option<&str>,
    bump_attempt: bool,
) -> Result<()> {
    sqlx::query(
        "UPDATE subtasks \
         SET status = $1, \
             diff = COALESCE($2, diff), \
             attempt_count = attempt_count + CASE WHEN $3 THEN 1 ELSE 0 END, \
             updated_at = NOW() \
         WHERE id = $4",
    )
    .bind(status)
    .bind(diff)
    .bind(bump_attempt)
    .bind(subtask_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to update subtask {subtask_id} status"))?;

    Ok(())
}

/// `true` once every subtask under `parent_task_id` is `completed`.
pub async fn all_subtasks_completed(pool: &PgPool, parent_task_id: Uuid) -> Result<bool> {
    let row: (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COUNT(*) FILTER (WHERE status = 'completed') \
         FROM subtasks WHERE parent_task_id = $1",
    )
    .bind(parent_task_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to check subtask completion for {parent_task_id}"))?;

    Ok(row.0 > 0 && row.0 == row.1)
}
