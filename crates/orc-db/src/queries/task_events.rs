//! Database query functions for the `task_events` append-only log.
//!
//! Generalizes the donor's `agent_events` table (keyed by task + attempt) to
//! a task-scoped event log keyed by task + event type, since events here
//! span the whole pipeline (`Planned`, `Coded`, `ConsensusDecision`,
//! `ReplanTriggered`, ...) rather than only agent-harness output.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::TaskEvent;

/// Parameters for inserting a new task event row.
#[derive(Debug, Clone)]
pub struct NewTaskEvent {
    pub task_id: Uuid,
    pub event_type: String,
    pub agent: Option<String>,
    pub input_summary: Option<String>,
    pub output_summary: Option<String>,
    pub tokens: Option<i64>,
    pub duration_ms: Option<i64>,
    pub metadata: Value,
}

/// Insert a new task event row. Returns the inserted row with
/// server-generated defaults (id, recorded_at).
pub async fn insert_task_event(pool: &PgPool, new: &NewTaskEvent) -> Result<TaskEvent> {
    let event = sqlx::query_as::<_, TaskEvent>(
        "INSERT INTO task_events \
            (task_id, event_type, agent, input_summary, output_summary, tokens, \
             duration_ms, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(&new.event_type)
    .bind(&new.agent)
    .bind(&new.input_summary)
    .bind(&new.output_summary)
    .bind(new.tokens)
    .bind(new.duration_ms)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert task event for task {} type {}",
            new.task_id, new.event_type
        )
    })?;

    Ok(event)
}

/// Get all events for a given task, oldest first.
pub async fn list_events_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskEvent>> {
    let events = sqlx::query_as::<_, TaskEvent>(
        "SELECT * FROM task_events WHERE task_id = $1 ORDER BY recorded_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list task events for task {task_id}"))?;

    Ok(events)
}

/// Get the most recent event of a given type for a task, if any. Used by
/// the `Reviewing → Reviewing` idempotent-resume check (does the last
/// `Reviewed` event already reflect the current decision?).
pub async fn last_event_of_type(
    pool: &PgPool,
    task_id: Uuid,
    event_type: &str,
) -> Result<Option<TaskEvent>> {
    let event = sqlx::query_as::<_, TaskEvent>(
        "SELECT * FROM task_events \
         WHERE task_id = $1 AND event_type = $2 \
         ORDER BY recorded_at DESC LIMIT 1",
    )
    .bind(task_id)
    .bind(event_type)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to fetch last {event_type} event for task {task_id}"))?;

    Ok(event)
}

/// Count events of a given type for a task (e.g. how many `DiffSanitized`
/// rewrites have happened).
pub async fn count_events_of_type(
    pool: &PgPool,
    task_id: Uuid,
    event_type: &str,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM task_events WHERE task_id = $1 AND event_type = $2",
    )
    .bind(task_id)
    .bind(event_type)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to count {event_type} events for task {task_id}"))?;

    Ok(row.0)
}
