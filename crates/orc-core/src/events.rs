//! ObservationBus/EventLog: a typed event bus layered directly on
//! `tracing`, with every emission also persisted as a [`TaskEvent`] row
//! (spec §3, §9 "Event log hooks").
//!
//! Hook invocations (the persistence write) are best-effort: a failure to
//! persist logs a warning but never fails the caller's main path, per
//! spec §9.

use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use orc_db::queries::task_events::{insert_task_event, NewTaskEvent};

/// The closed set of event types named in spec §3, plus the few the
/// ambient stack needs (`DiffSanitized` for the sanitizer open-question
/// decision, `ConflictDetected`/`BatchPrCreated` for batching).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Planned,
    Coded,
    Tested,
    Fixed,
    Reviewed,
    PrOpened,
    Failed,
    Completed,
    ConsensusDecision,
    AgenticLoopComplete,
    ReflectionComplete,
    ReplanTriggered,
    ConflictDetected,
    BatchPrCreated,
    DiffSanitized,
    Decomposed,
    SubtaskCompleted,
    GateChecked,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Coded => "coded",
            Self::Tested => "tested",
            Self::Fixed => "fixed",
            Self::Reviewed => "reviewed",
            Self::PrOpened => "pr_opened",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::ConsensusDecision => "consensus_decision",
            Self::AgenticLoopComplete => "agentic_loop_complete",
            Self::ReflectionComplete => "reflection_complete",
            Self::ReplanTriggered => "replan_triggered",
            Self::ConflictDetected => "conflict_detected",
            Self::BatchPrCreated => "batch_pr_created",
            Self::DiffSanitized => "diff_sanitized",
            Self::Decomposed => "decomposed",
            Self::SubtaskCompleted => "subtask_completed",
            Self::GateChecked => "gate_checked",
        }
    }
}

/// Emit a `tracing::info!` span and persist the corresponding `TaskEvent`
/// row. Persistence failure is logged and swallowed.
pub async fn record(
    pool: &PgPool,
    task_id: Uuid,
    event_type: EventType,
    agent: Option<&str>,
    input_summary: Option<&str>,
    output_summary: Option<&str>,
) {
    info!(%task_id, event_type = event_type.as_str(), agent, "task event");

    let new_event = NewTaskEvent {
        task_id,
        event_type: event_type.as_str().to_owned(),
        agent: agent.map(str::to_owned),
        input_summary: input_summary.map(str::to_owned),
        output_summary: output_summary.map(str::to_owned),
        tokens: None,
        duration_ms: None,
        metadata: json!({}),
    };

    if let Err(err) = insert_task_event(pool, &new_event).await {
        warn!(%task_id, %err, "failed to persist task event (best-effort, continuing)");
    }
}

/// Variant of [`record`] that attaches free-form metadata and token/duration
/// counters, used by the richer events (`ConsensusDecision`,
/// `AgenticLoopComplete`, `ConflictDetected`).
#[allow(clippy::too_many_arguments)]
pub async fn record_with_metadata(
    pool: &PgPool,
    task_id: Uuid,
    event_type: EventType,
    agent: Option<&str>,
    tokens: Option<i64>,
    duration_ms: Option<i64>,
    metadata: serde_json::Value,
) {
    info!(%task_id, event_type = event_type.as_str(), agent, ?metadata, "task event");

    let new_event = NewTaskEvent {
        task_id,
        event_type: event_type.as_str().to_owned(),
        agent: agent.map(str::to_owned),
        input_summary: None,
        output_summary: None,
        tokens,
        duration_ms,
        metadata,
    };

    if let Err(err) = insert_task_event(pool, &new_event).await {
        warn!(%task_id, %err, "failed to persist task event (best-effort, continuing)");
    }
}
