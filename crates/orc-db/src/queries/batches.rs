//! Database query functions for `batches` and `batch_memberships`
//! (spec §3, §4.9).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Batch, BatchStatus};

/// Insert a new pending batch for a repo.
pub async fn insert_batch(
    pool: &PgPool,
    repo: &str,
    base_branch: &str,
    target_files: &[String],
) -> Result<Batch> {
    let batch = sqlx::query_as::<_, Batch>(
        "INSERT INTO batches (repo, base_branch, target_files, status) \
         VALUES ($1, $2, $3, 'pending') \
         RETURNING *",
    )
    .bind(repo)
    .bind(base_branch)
    .bind(target_files)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert batch for repo {repo}"))?;

    Ok(batch)
}

/// Fetch a batch by id.
pub async fn get_batch(pool: &PgPool, id: Uuid) -> Result<Option<Batch>> {
    let batch = sqlx::query_as::<_, Batch>("SELECT * FROM batches WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch batch")?;

    Ok(batch)
}

/// List every pending batch for a repo, oldest first -- candidates a task
/// can join (spec §4.9 step 2).
pub async fn get_pending_batches(pool: &PgPool, repo: &str) -> Result<Vec<Batch>> {
    let batches = sqlx::query_as::<_, Batch>(
        "SELECT * FROM batches WHERE repo = $1 AND status = 'pending' ORDER BY created_at ASC",
    )
    .bind(repo)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list pending batches for repo {repo}"))?;

    Ok(batches)
}

/// Find the batch a task currently belongs to, if any.
pub async fn get_batch_by_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Batch>> {
    let batch = sqlx::query_as::<_, Batch>(
        "SELECT b.* FROM batches b \
         JOIN batch_memberships m ON m.batch_id = b.id \
         WHERE m.task_id = $1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to fetch batch for task {task_id}"))?;

    Ok(batch)
}

/// List task ids that belong to a batch, in join order.
pub async fn get_tasks_by_batch(pool: &PgPool, batch_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT task_id FROM batch_memberships WHERE batch_id = $1 ORDER BY joined_at ASC",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list tasks for batch {batch_id}"))?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Add a task to a batch. Fails (primary key violation) if the task is
/// already a member of some batch -- enforcing invariant 4 (a task belongs
/// to at most one pending batch) at the data layer.
pub async fn add_task_to_batch(pool: &PgPool, task_id: Uuid, batch_id: Uuid) -> Result<()> {
    sqlx::query("INSERT INTO batch_memberships (task_id, batch_id) VALUES ($1, $2)")
        .bind(task_id)
        .bind(batch_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to add task {task_id} to batch {batch_id}"))?;

    Ok(())
}

/// Remove a task from its batch (used on batch-conflict fallback, spec §4.9).
pub async fn remove_task_from_batch(pool: &PgPool, task_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM batch_memberships WHERE task_id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to remove task {task_id} from its batch"))?;

    Ok(())
}

/// Update a batch's status, and (when moving to `completed`) record the
/// resulting combined PR and the processed timestamp.
pub async fn update_batch_status(
    pool: &PgPool,
    batch_id: Uuid,
    status: BatchStatus,
    pr_number: Option<i32>,
    pr_url: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE batches \
         SET status = $1, \
             pr_number = COALESCE($2, pr_number), \
             pr_url = COALESCE($3, pr_url), \
             processed_at = CASE WHEN $1 IN ('completed', 'failed') THEN NOW() ELSE processed_at END \
         WHERE id = $4",
    )
    .bind(status)
    .bind(pr_number)
    .bind(pr_url)
    .bind(batch_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to update batch {batch_id} status"))?;

    Ok(())
}

/// `true` once a batch's elapsed age exceeds the configured timeout, one of
/// the two readiness conditions in spec §4.9 "Readiness".
pub fn is_batch_timed_out(batch: &Batch, now: DateTime<Utc>, timeout_minutes: i64) -> bool {
    now.signed_duration_since(batch.created_at).num_minutes() >= timeout_minutes
}
