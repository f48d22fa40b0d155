//! MemorySubsystem: a best-effort recording API over
//! `orc_db::queries::memory` — fix patterns, failure modes, archival
//! knowledge, and conventions (spec §3, §9 "Event log hooks": hook
//! invocations are best-effort and must not fail the main path).

use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use orc_db::models::{Archive, Observation, Pattern, PatternKind};
use orc_db::queries::memory as memory_db;

/// Record an observation. Never fails the caller: a persistence error is
/// logged and swallowed, matching [`crate::events::record`]'s shape.
pub async fn observe(
    pool: &PgPool,
    task_id: Uuid,
    obs_type: &str,
    agent: Option<&str>,
    content: &str,
    tags: &[String],
) -> Option<Observation> {
    match memory_db::insert_observation(pool, task_id, obs_type, agent, content, tags).await {
        Ok(observation) => Some(observation),
        Err(err) => {
            warn!(%task_id, %err, "failed to record observation (best-effort, continuing)");
            None
        }
    }
}

/// Record a failure-mode observation with a structured avoidance strategy,
/// the memory entry `failTask` writes for every non-recoverable error
/// (spec §7).
pub async fn record_failure_mode(
    pool: &PgPool,
    task_id: Uuid,
    code: &str,
    message: &str,
    suggested_action: &str,
) -> Option<Observation> {
    let content = format!("{code}: {message} (suggested action: {suggested_action})");
    observe(
        pool,
        task_id,
        "failure_mode",
        None,
        &content,
        &[code.to_owned()],
    )
    .await
}

/// Look up known fix/convention/failure patterns for a repo (falling back
/// to global patterns when `repo` is `None`), most-confident first.
pub async fn patterns_for(
    pool: &PgPool,
    repo: Option<&str>,
    kind: PatternKind,
) -> anyhow::Result<Vec<Pattern>> {
    let mut patterns = memory_db::find_patterns(pool, repo, kind).await?;
    patterns.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());
    Ok(patterns)
}

/// Record that a pattern was applied successfully, bumping its confidence.
/// Best-effort: a persistence failure is logged, not propagated.
pub async fn record_pattern_success(pool: &PgPool, pattern_id: Uuid) {
    if let Err(err) = memory_db::record_pattern_use(pool, pattern_id).await {
        warn!(%pattern_id, %err, "failed to record pattern use (best-effort, continuing)");
    }
}

/// Learn a new fix pattern from a successful agentic-loop fix or reviewer
/// comment (best-effort; never fails the caller).
pub async fn learn_pattern(
    pool: &PgPool,
    repo: Option<&str>,
    kind: PatternKind,
    trigger: &str,
    solution: &str,
) -> Option<Pattern> {
    match memory_db::insert_pattern(pool, repo, kind, trigger, solution).await {
        Ok(pattern) => Some(pattern),
        Err(err) => {
            warn!(%err, "failed to learn pattern (best-effort, continuing)");
            None
        }
    }
}

/// Archive a piece of knowledge (e.g. a plan summary, a reviewer rationale)
/// for later retrieval. Best-effort.
pub async fn archive(
    pool: &PgPool,
    repo: Option<&str>,
    content: &str,
    summary: &str,
    source_type: &str,
    importance: f32,
) -> Option<Archive> {
    match memory_db::insert_archive(pool, repo, content, summary, source_type, importance).await {
        Ok(archive) => Some(archive),
        Err(err) => {
            warn!(%err, "failed to archive knowledge (best-effort, continuing)");
            None
        }
    }
}

/// Retrieve the most important archived knowledge for a repo (or global
/// scope), for injection into planner/coder prompts.
pub async fn top_archives(
    pool: &PgPool,
    repo: Option<&str>,
    limit: i64,
) -> anyhow::Result<Vec<Archive>> {
    memory_db::top_archives(pool, repo, limit).await
}
