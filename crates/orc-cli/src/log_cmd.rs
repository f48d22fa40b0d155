//! `orc log` command: show the lifecycle event log for a task.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use orc_db::queries::task_events;
use orc_db::queries::tasks as task_db;

/// Run the log command. `event_type` optionally filters to one event kind
/// (e.g. `coded`, `tested`, `replan_triggered`).
pub async fn run_log(pool: &PgPool, task_id_str: &str, event_type: Option<&str>) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;

    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task: {} #{} ({})", task.repo, task.issue_number, task.id);
    println!(
        "Status: {} (attempt {}/{})",
        task.status, task.attempt_count, task.max_attempts
    );
    println!();

    let events = task_events::list_events_for_task(pool, task_id).await?;
    let events: Vec<_> = match event_type {
        Some(t) => events.into_iter().filter(|e| e.event_type == t).collect(),
        None => events,
    };

    if events.is_empty() {
        println!("No events recorded.");
        return Ok(());
    }

    println!("Events ({}):", events.len());
    for event in &events {
        let time = event.recorded_at.format("%H:%M:%S%.3f");
        let agent = event.agent.as_deref().unwrap_or("-");
        let summary = event.output_summary.as_deref().unwrap_or("");
        let tokens = event
            .tokens
            .map(|t| format!(" tokens={t}"))
            .unwrap_or_default();
        println!("  [{time}] {} (agent={agent}){tokens}: {summary}", event.event_type);
    }

    Ok(())
}
