//! Database query functions for the memory subsystem tables: `observations`,
//! `patterns`, `archives` (spec §3, §4).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Archive, Observation, Pattern, PatternKind};

/// Record an observation emitted during a task's lifecycle.
pub async fn insert_observation(
    pool: &PgPool,
    task_id: Uuid,
    obs_type: &str,
    agent: Option<&str>,
    content: &str,
    tags: &[String],
) -> Result<Observation> {
    let observation = sqlx::query_as::<_, Observation>(
        "INSERT INTO observations (task_id, obs_type, agent, content, tags) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(obs_type)
    .bind(agent)
    .bind(content)
    .bind(tags)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert observation for task {task_id}"))?;

    Ok(observation)
}

/// List all observations recorded for a task, oldest first.
pub async fn list_observations_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Observation>> {
    let observations = sqlx::query_as::<_, Observation>(
        "SELECT * FROM observations WHERE task_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list observations for task {task_id}"))?;

    Ok(observations)
}

/// Insert a newly learned pattern (confidence starts low; it's raised by
/// [`record_pattern_use`] as it proves itself out).
pub async fn insert_pattern(
    pool: &PgPool,
    repo: Option<&str>,
    kind: PatternKind,
    trigger: &str,
    solution: &str,
) -> Result<Pattern> {
    let pattern = sqlx::query_as::<_, Pattern>(
        "INSERT INTO patterns (repo, kind, trigger, solution) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(repo)
    .bind(kind)
    .bind(trigger)
    .bind(solution)
    .fetch_one(pool)
    .await
    .context("failed to insert pattern")?;

    Ok(pattern)
}

/// Find candidate patterns for a repo (plus global, repo = NULL ones),
/// ranked by confidence then recency -- used to seed retries and plans with
/// prior learning.
pub async fn find_patterns(
    pool: &PgPool,
    repo: Option<&str>,
    kind: PatternKind,
) -> Result<Vec<Pattern>> {
    let patterns = sqlx::query_as::<_, Pattern>(
        "SELECT * FROM patterns \
         WHERE kind = $1 AND (repo = $2 OR repo IS NULL) \
         ORDER BY confidence DESC, last_used DESC NULLS LAST",
    )
    .bind(kind)
    .bind(repo)
    .fetch_all(pool)
    .await
    .context("failed to find patterns")?;

    Ok(patterns)
}

/// Bump a pattern's success count and confidence after it is applied
/// successfully. Confidence is nudged toward 1.0 and capped there.
pub async fn record_pattern_use(pool: &PgPool, pattern_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE patterns \
         SET success_count = success_count + 1, \
             confidence = LEAST(1.0, confidence + 0.05), \
             last_used = NOW() \
         WHERE id = $1",
    )
    .bind(pattern_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to record pattern use for {pattern_id}"))?;

    Ok(())
}

/// Archive a piece of knowledge (a completed task summary, a closed batch,
/// a rejected plan) with an importance score for later recall.
pub async fn insert_archive(
    pool: &PgPool,
    repo: Option<&str>,
    content: &str,
    summary: &str,
    source_type: &str,
    importance: f32,
) -> Result<Archive> {
    let archive = sqlx::query_as::<_, Archive>(
        "INSERT INTO archives (repo, content, summary, source_type, importance) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(repo)
    .bind(content)
    .bind(summary)
    .bind(source_type)
    .bind(importance)
    .fetch_one(pool)
    .await
    .context("failed to insert archive")?;

    Ok(archive)
}

/// List the highest-importance archives for a repo, most important first.
pub async fn top_archives(pool: &PgPool, repo: Option<&str>, limit: i64) -> Result<Vec<Archive>> {
    let archives = sqlx::query_as::<_, Archive>(
        "SELECT * FROM archives \
         WHERE repo = $1 OR repo IS NULL \
         ORDER BY importance DESC, created_at DESC \
         LIMIT $2",
    )
    .bind(repo)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list top archives")?;

    Ok(archives)
}
