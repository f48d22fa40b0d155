//! GateValidator (spec §4.2): per-handoff artifact checks that permit a
//! task to proceed from one phase to the next. Each gate is a pure
//! predicate over a [`Task`]'s persisted fields -- it never re-executes
//! commands or invariants (that happens in the Testing handler via
//! [`crate::invariant::runner`]) -- returning `(passed, missing[], details,
//! timestamp)`. Every invocation appends a `GateChecked` trace event.

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use orc_db::models::{Task, TaskStatus};

use crate::diff::{parser, validator};
use crate::events::{self, EventType};

/// Which named gate is being consulted (spec §4.2's table, in order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    PlanningComplete,
    CodingComplete,
    TestingComplete,
    ReviewComplete,
}

impl GateKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::PlanningComplete => "planning_complete",
            Self::CodingComplete => "coding_complete",
            Self::TestingComplete => "testing_complete",
            Self::ReviewComplete => "review_complete",
        }
    }
}

/// The outcome of one gate check (spec §4.2 "returns `(passed, missing[],
/// details, timestamp)`").
#[derive(Debug, Clone)]
pub struct GateCheck {
    pub gate: GateKind,
    pub passed: bool,
    pub missing: Vec<String>,
    pub details: String,
    pub checked_at: chrono::DateTime<Utc>,
}

impl GateCheck {
    fn new(gate: GateKind, missing: Vec<String>, details: impl Into<String>) -> Self {
        Self {
            gate,
            passed: missing.is_empty(),
            missing,
            details: details.into(),
            checked_at: Utc::now(),
        }
    }
}

/// `PlanningComplete`: requires `plan`, `target_files`, `dod`, and
/// `complexity`. `effort` is optional and defaults to `medium` elsewhere
/// (spec §4.2).
pub fn planning_complete(task: &Task) -> GateCheck {
    let mut missing = Vec::new();
    if task.plan_steps.is_empty() {
        missing.push("plan".to_owned());
    }
    if task.target_files.is_empty() {
        missing.push("target_files".to_owned());
    }
    if task.dod.is_empty() {
        missing.push("definition_of_done".to_owned());
    }
    if task.complexity.is_none() {
        missing.push("complexity".to_owned());
    }
    GateCheck::new(
        GateKind::PlanningComplete,
        missing,
        "planning artifacts present",
    )
}

/// `CodingComplete`: requires a non-empty `current_diff` containing valid
/// diff markers, a `branch`, and a total line count at or under
/// `max_diff_lines`.
pub fn coding_complete(task: &Task, max_diff_lines: usize) -> GateCheck {
    let mut missing = Vec::new();
    let mut details = String::new();

    match task.current_diff.as_deref() {
        None | Some("") => missing.push("current_diff".to_owned()),
        Some(diff) => {
            let (validation, _, _) = validator::quick_validate(diff);
            if !validation.valid {
                missing.push("current_diff".to_owned());
                details = format!("diff failed quick validation: {}", validation.errors.join("; "));
            } else {
                let files = parser::parse(diff).unwrap_or_default();
                let line_count = validator::total_line_count(&files);
                if line_count > max_diff_lines {
                    missing.push("line_count".to_owned());
                    details = format!(
                        "diff has {line_count} lines, exceeds max_diff_lines={max_diff_lines}"
                    );
                }
            }
        }
    }

    if task.branch_name.as_deref().unwrap_or("").is_empty() {
        missing.push("branch".to_owned());
    }

    GateCheck::new(GateKind::CodingComplete, missing, details)
}

/// `TestingComplete`: requires `status == TestsPassed` and
/// `attempt_count <= max_attempts`.
pub fn testing_complete(task: &Task) -> GateCheck {
    let mut missing = Vec::new();
    if task.status != TaskStatus::TestsPassed {
        missing.push("status=tests_passed".to_owned());
    }
    if task.attempt_count > task.max_attempts {
        missing.push("attempts_within_budget".to_owned());
    }
    GateCheck::new(
        GateKind::TestingComplete,
        missing,
        format!("status={} attempt_count={}", task.status, task.attempt_count),
    )
}

/// `ReviewComplete`: requires `status == ReviewApproved`.
pub fn review_complete(task: &Task) -> GateCheck {
    let mut missing = Vec::new();
    if task.status != TaskStatus::ReviewApproved {
        missing.push("approved_review".to_owned());
    }
    GateCheck::new(
        GateKind::ReviewComplete,
        missing,
        format!("status={}", task.status),
    )
}

/// Run a named gate and persist a `GateChecked` trace event (spec §4.2
/// "Every gate invocation appends a trace event").
pub async fn check(pool: &PgPool, task_id: Uuid, result: GateCheck) -> GateCheck {
    events::record_with_metadata(
        pool,
        task_id,
        EventType::GateChecked,
        None,
        None,
        None,
        json!({
            "gate": result.gate.as_str(),
            "passed": result.passed,
            "missing": result.missing,
            "details": result.details,
        }),
    )
    .await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_db::models::Complexity;
    use uuid::Uuid;

    fn base_task() -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            repo: "acme/x".to_owned(),
            issue_number: 1,
            status: TaskStatus::PlanningDone,
            dod: vec!["greet returns hi".to_owned()],
            plan_steps: vec!["add fn greet".to_owned()],
            target_files: vec!["src/greet.ts".to_owned()],
            multi_file_plan: None,
            commands: json!([]),
            complexity: Some(Complexity::Xs),
            effort: None,
            requested_harness: None,
            branch_name: None,
            current_diff: None,
            commit_message: None,
            worktree_path: None,
            pr_number: None,
            pr_url: None,
            pr_title: None,
            attempt_count: 0,
            max_attempts: 3,
            last_error: None,
            root_cause: None,
            loop_iterations: 0,
            loop_replans: 0,
            last_confidence: None,
            loop_duration_ms: None,
            parent_task_id: None,
            subtask_index: None,
            is_orchestrated: false,
            current_subtask_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn planning_complete_passes_with_all_fields() {
        let check = planning_complete(&base_task());
        assert!(check.passed, "{:?}", check.missing);
    }

    #[test]
    fn planning_complete_flags_missing_complexity() {
        let mut task = base_task();
        task.complexity = None;
        let check = planning_complete(&task);
        assert!(!check.passed);
        assert!(check.missing.contains(&"complexity".to_owned()));
    }

    #[test]
    fn coding_complete_requires_diff_and_branch() {
        let task = base_task();
        let check = coding_complete(&task, 700);
        assert!(!check.passed);
        assert!(check.missing.contains(&"current_diff".to_owned()));
        assert!(check.missing.contains(&"branch".to_owned()));
    }

    #[test]
    fn coding_complete_passes_with_valid_small_diff() {
        let mut task = base_task();
        task.current_diff = Some("--- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n-old\n+new\n".to_owned());
        task.branch_name = Some("orc/plan/task".to_owned());
        let check = coding_complete(&task, 700);
        assert!(check.passed, "{:?}", check.missing);
    }

    #[test]
    fn coding_complete_flags_oversized_diff() {
        let mut task = base_task();
        task.current_diff = Some("--- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n-old\n+new\n".to_owned());
        task.branch_name = Some("orc/plan/task".to_owned());
        let check = coding_complete(&task, 1);
        assert!(!check.passed);
        assert!(check.missing.contains(&"line_count".to_owned()));
    }

    #[test]
    fn testing_complete_requires_tests_passed_status() {
        let mut task = base_task();
        task.status = TaskStatus::Testing;
        let check = testing_complete(&task);
        assert!(!check.passed);
    }

    #[test]
    fn testing_complete_flags_exhausted_attempts() {
        let mut task = base_task();
        task.status = TaskStatus::TestsPassed;
        task.attempt_count = 4;
        task.max_attempts = 3;
        let check = testing_complete(&task);
        assert!(!check.passed);
    }

    #[test]
    fn review_complete_requires_approved_status() {
        let mut task = base_task();
        task.status = TaskStatus::Reviewing;
        let check = review_complete(&task);
        assert!(!check.passed);
        assert!(check.missing.contains(&"approved_review".to_owned()));
    }
}
